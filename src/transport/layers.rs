mod log;

pub use log::{PublishLogLayer, PublishLogService};
