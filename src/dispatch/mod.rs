//! Event dispatch: the selector loop, its poll strategies, and the delivery
//! workers that run user callbacks.

pub(crate) mod poll_strategy;
pub(crate) mod selector;
pub(crate) mod worker;
