pub mod google_code_assist;
