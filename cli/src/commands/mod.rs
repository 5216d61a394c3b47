pub mod close_batch;
pub mod query;
pub mod register_session;
pub mod retry;
pub mod run;
