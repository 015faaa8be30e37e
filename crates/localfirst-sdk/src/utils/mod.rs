pub mod time;

pub use time::{age_millis, now_millis};
