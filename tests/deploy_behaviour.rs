//! Behavioural scenarios for `hoist deploy` and `hoist cleanup` against a
//! simulated host.

mod deploy;
