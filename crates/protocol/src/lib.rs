//! Message bus and round execution for negotopo.

pub mod bus;
pub mod round;

pub use bus::MessageBus;
pub use round::{
    should_communicate, AgentOutcome, NegotiationRound, RelevanceFilter, RoundConfig,
    RoundRecord, RoundResult, RoundState, RoundStats,
};
