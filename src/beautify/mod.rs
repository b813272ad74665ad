//! Turns tested nodes into the final ordered, renamed list.

pub mod node;
pub mod processor;
pub mod subscription;

pub use node::{rate_tag, Node, NO_SPEED, OLD_NAME_ATTR};
pub use processor::{country_delay, group_subscriptions, process};
pub use subscription::{sub_name_and_num, InfoLine, Subscription, SubscriptionInfo, INFO_NODE_ATTR};
