mod client;
mod types;


pub use client::{BatchLookup, Client, SubscriberPage};
pub use types::{SubscriberData, SubscriberEnvelope};
