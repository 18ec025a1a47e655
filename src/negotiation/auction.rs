//! First- and second-price auctions with an optional reserve.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::{deadline_after, Session, SessionTable};
use crate::errors::{CoordinationError, Result};
use crate::events::{EventKind, EventLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionType {
    /// The winner pays its own bid.
    FirstPrice,
    /// The winner pays the second-highest bid.
    SecondPrice,
}

/// Whether bidders can see the standing high bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidVisibility {
    /// Hidden bids; a bidder's later bid replaces its earlier one.
    Sealed,
    /// Public high bid; each new bid must beat it.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionState {
    Open,
    Closed,
}

/// Parameters for opening an auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionSpec {
    pub item: String,
    pub auctioneer: String,
    pub auction_type: AuctionType,
    pub visibility: BidVisibility,
    /// Bids below this are refused; also the price paid in a second-price
    /// auction with a single bidder.
    #[serde(default)]
    pub starting_price: f64,
    /// A winning bid below this voids the sale.
    pub reserve_price: Option<f64>,
    /// Restrict bidding to these agents; everyone but the auctioneer when `None`.
    pub eligible_bidders: Option<Vec<String>>,
}

impl AuctionSpec {
    pub fn new(item: impl Into<String>, auctioneer: impl Into<String>, auction_type: AuctionType) -> Self {
        Self {
            item: item.into(),
            auctioneer: auctioneer.into(),
            auction_type,
            visibility: BidVisibility::Sealed,
            starting_price: 0.0,
            reserve_price: None,
            eligible_bidders: None,
        }
    }

    pub fn with_visibility(mut self, visibility: BidVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_starting_price(mut self, price: f64) -> Self {
        self.starting_price = price;
        self
    }

    pub fn with_reserve(mut self, reserve: f64) -> Self {
        self.reserve_price = Some(reserve);
        self
    }

    pub fn with_bidders<I, S>(mut self, bidders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eligible_bidders = Some(bidders.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bidder: String,
    pub amount: f64,
    pub placed_at: DateTime<Utc>,
    /// Arrival order within the auction; breaks ties between equal bids.
    pub sequence: u64,
}

/// Result computed once when the auction closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionOutcome {
    pub auction_id: String,
    pub item: String,
    pub auction_type: AuctionType,
    /// `None` when there were no bids or the reserve was not met.
    pub winner: Option<String>,
    pub price: Option<f64>,
    pub highest_bid: Option<f64>,
    pub bid_count: usize,
    pub reserve_met: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auction {
    pub id: String,
    pub spec: AuctionSpec,
    pub state: AuctionState,
    /// Bids in arrival order.
    pub bids: Vec<Bid>,
    pub deadline: DateTime<Utc>,
    pub result: Option<AuctionOutcome>,
    next_sequence: u64,
}

impl Auction {
    fn check_bidder(&self, bidder: &str) -> Result<()> {
        let eligible = bidder != self.spec.auctioneer
            && self
                .spec
                .eligible_bidders
                .as_ref()
                .map_or(true, |list| list.iter().any(|b| b == bidder));
        if eligible {
            Ok(())
        } else {
            Err(CoordinationError::NotParticipant {
                session_id: self.id.clone(),
                agent_id: bidder.to_string(),
            })
        }
    }

    pub fn high_bid(&self) -> Option<&Bid> {
        self.best_bids().into_iter().next()
    }

    /// Each bidder's best bid, ordered highest first, earliest first on ties.
    fn best_bids(&self) -> Vec<&Bid> {
        let mut best: HashMap<&str, &Bid> = HashMap::new();
        for bid in &self.bids {
            best.entry(bid.bidder.as_str())
                .and_modify(|current| {
                    if bid.amount > current.amount {
                        *current = bid;
                    }
                })
                .or_insert(bid);
        }
        let mut ranked: Vec<&Bid> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.amount
                .total_cmp(&a.amount)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        ranked
    }

    /// Compute the winner and price. Called exactly once, on close.
    fn settle(&mut self) {
        let ranked = self.best_bids();
        let highest = ranked.first().map(|b| (b.bidder.clone(), b.amount));
        let price = match self.spec.auction_type {
            AuctionType::FirstPrice => highest.as_ref().map(|(_, amount)| *amount),
            AuctionType::SecondPrice => highest
                .as_ref()
                .map(|_| ranked.get(1).map_or(self.spec.starting_price, |b| b.amount)),
        };
        let reserve_met = match (&highest, self.spec.reserve_price) {
            (Some((_, amount)), Some(reserve)) => *amount >= reserve,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let outcome = AuctionOutcome {
            auction_id: self.id.clone(),
            item: self.spec.item.clone(),
            auction_type: self.spec.auction_type,
            winner: if reserve_met {
                highest.as_ref().map(|(bidder, _)| bidder.clone())
            } else {
                None
            },
            price: if reserve_met { price } else { None },
            highest_bid: highest.map(|(_, amount)| amount),
            bid_count: self.bids.len(),
            reserve_met,
        };
        self.state = AuctionState::Closed;
        self.result = Some(outcome);
    }
}

impl Session for Auction {
    type Outcome = AuctionOutcome;

    fn initiator(&self) -> &str {
        &self.spec.auctioneer
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    fn outcome(&self) -> Option<AuctionOutcome> {
        self.result.clone()
    }

    fn finalize_at_deadline(&mut self) {
        self.settle();
    }

    fn closed_event() -> EventKind {
        EventKind::AuctionClosed
    }
}

/// Runs auctions.
pub struct AuctionHouse {
    sessions: SessionTable<Auction>,
}

impl std::fmt::Debug for AuctionHouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuctionHouse")
            .field("auctions", &self.sessions.len())
            .finish()
    }
}

impl AuctionHouse {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            sessions: SessionTable::new(log, "AuctionHouse"),
        }
    }

    /// Open an auction that closes after `duration`. Returns its id.
    pub fn open(&self, spec: AuctionSpec, duration: Duration) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        log::debug!(
            "[AuctionHouse] {} opened {:?} auction {} for {}",
            spec.auctioneer,
            spec.auction_type,
            id,
            spec.item
        );
        let auction = Auction {
            id: id.clone(),
            spec,
            state: AuctionState::Open,
            bids: Vec::new(),
            deadline: deadline_after(duration),
            result: None,
            next_sequence: 0,
        };
        self.sessions.insert(id.clone(), auction);
        Ok(id)
    }

    /// Place a bid. Returns `false` (no-op) when the auction has closed,
    /// the bid is below the starting price, or, in an open auction, it does
    /// not beat the standing high bid.
    pub fn place_bid(&self, auction_id: &str, bidder: &str, amount: f64) -> Result<bool> {
        let placed = self.sessions.with_open(auction_id, |auction| {
            auction.check_bidder(bidder)?;
            if !amount.is_finite() || amount < auction.spec.starting_price {
                return Ok(false);
            }
            if auction.spec.visibility == BidVisibility::Open
                && auction.high_bid().map_or(false, |b| amount <= b.amount)
            {
                return Ok(false);
            }

            let sequence = auction.next_sequence;
            auction.next_sequence += 1;
            if auction.spec.visibility == BidVisibility::Sealed {
                auction.bids.retain(|b| b.bidder != bidder);
            }
            auction.bids.push(Bid {
                bidder: bidder.to_string(),
                amount,
                placed_at: Utc::now(),
                sequence,
            });
            Ok(true)
        });

        match placed {
            Err(CoordinationError::SessionClosed { .. }) => {
                log::debug!("[AuctionHouse] Late bid from {} on {} ignored", bidder, auction_id);
                Ok(false)
            }
            other => other,
        }
    }

    /// Standing high bid of an open-visibility auction; `None` while sealed.
    pub fn current_high_bid(&self, auction_id: &str) -> Result<Option<f64>> {
        let auction = self
            .sessions
            .get(auction_id)
            .ok_or_else(|| CoordinationError::UnknownSession {
                session_id: auction_id.to_string(),
            })?;
        if auction.spec.visibility == BidVisibility::Sealed && auction.state == AuctionState::Open {
            return Ok(None);
        }
        Ok(auction.high_bid().map(|b| b.amount))
    }

    /// Close before the deadline. Only the auctioneer may do this.
    pub fn close(&self, auction_id: &str, agent_id: &str) -> Result<AuctionOutcome> {
        self.sessions.with_open(auction_id, |auction| {
            if auction.spec.auctioneer != agent_id {
                return Err(CoordinationError::NotParticipant {
                    session_id: auction_id.to_string(),
                    agent_id: agent_id.to_string(),
                });
            }
            auction.settle();
            auction.result.clone().ok_or_else(|| CoordinationError::SessionClosed {
                session_id: auction_id.to_string(),
            })
        })
    }

    pub fn auction(&self, auction_id: &str) -> Option<Auction> {
        self.sessions.get(auction_id)
    }

    pub fn outcome(&self, auction_id: &str) -> Result<Option<AuctionOutcome>> {
        self.sessions.outcome(auction_id)
    }

    /// Block until the auction closes (at its deadline at the latest) or
    /// `timeout` elapses.
    pub fn wait_for_outcome(&self, auction_id: &str, timeout: Duration) -> Result<Option<AuctionOutcome>> {
        self.sessions.wait_for_outcome(auction_id, timeout)
    }

    pub fn sweep_expired(&self) -> Vec<AuctionOutcome> {
        self.sessions.sweep_expired()
    }
}
