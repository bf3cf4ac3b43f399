pub mod accounts;
pub mod attendance;
pub mod catalog;
pub mod core;
pub mod counselings;
pub mod feedbacks;
pub mod grades;
pub mod specialnotes;
pub mod students;
