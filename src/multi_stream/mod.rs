//! Route-by-key multi-stream processors — §4.15.
//!
//! Switch, Router, Split, and Partition all share a shape: compute a route
//! key (or boolean, or hash bucket) from each successful `Res<T>`, send it
//! to one of several output channels, and pass error results through a
//! dedicated error channel rather than any data route.

pub mod partition;
pub mod router;
pub mod split;
pub mod switch;

pub use partition::Partition;
pub use router::Router;
pub use split::Split;
pub use switch::Switch;
