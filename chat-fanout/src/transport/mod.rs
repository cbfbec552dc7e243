//! Network front-ends for the [`BroadcastHub`](crate::hub::BroadcastHub).
//!
//! Both transports attach their connections to the same hub instance, so a
//! message published over one reaches peers on the other.

pub mod tcp;
pub mod ws;
