pub mod child;
pub mod echo;
pub mod send_file;
