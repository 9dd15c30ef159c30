//! Concrete flow model and the desired-flow staging table.
//!
//! This crate defines what the translator *produces*: matches over
//! physical fields, flow actions, and the set-keyed staging table the
//! forwarding-plane agent consumes. The staging table supports the
//! ownership and removal operations the incremental translator depends
//! on: per-owner removal, addr-set-annotated removal with an expected
//! count, and transitive flood removal across shared (conjunctive)
//! flows.

pub mod consts;
pub mod flow;
pub mod table;

pub use flow::{AddrSetAnnotation, FieldValue, FlowAction, LearnMatch, Match, MatchField};
pub use table::{DesiredFlow, DesiredFlowTable, FlowDesc, FlowKey, FlowSink};
