//! Negotiation protocols: bilateral offers, auctions and consensus votes.
//!
//! Every session has a deadline. Actions apply in arrival order under the
//! session table's lock, and the terminal result is computed exactly once;
//! anything arriving after that is rejected.

pub mod auction;
pub mod bilateral;
mod session;
pub mod voting;

pub use auction::{
    Auction, AuctionHouse, AuctionOutcome, AuctionSpec, AuctionState, AuctionType, Bid, BidVisibility,
};
pub use bilateral::{Negotiation, NegotiationManager, NegotiationOutcome, NegotiationState, Offer};
pub use voting::{Ballot, Vote, VoteOutcome, VoteSpec, VoteState, VotingBooth, VotingMethod};
