pub mod process_cleanup;
