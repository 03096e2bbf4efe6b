mod stalling;
pub(crate) use stalling::{MAX_CONSUMERS, StallingQueue};
