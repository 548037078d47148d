//! Rating Engine (C3): pairwise Elo-style rating update and parimutuel
//! stake settlement.
//!
//! Both functions here are pure and deterministic — no I/O, no clock reads
//! — so every replica computes identical results from identical inputs.

use crate::arena::model::Bet;

/// Default K-factor. Overridable via [`crate::arena::config::ArenaConfig`];
/// this constant is only the fallback.
pub const DEFAULT_K_FACTOR: f64 = 32.0;

/// Before/after/delta for one side of a rating update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingChange {
    pub old_rating: i64,
    pub new_rating: i64,
    pub delta: i64,
}

/// Result of [`update_ratings`]: callers skip it entirely on a tie, since
/// a tie changes neither rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingUpdate {
    pub winner: RatingChange,
    pub loser: RatingChange,
}

/// Expected score of a player rated `rating_a` against one rated
/// `rating_b`, per the standard logistic Elo formula.
fn expected_score(rating_a: i64, rating_b: i64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) as f64 / 400.0))
}

/// Compute the rating delta for a decisive contest outcome. Used both for
/// ordinary completion and for forfeit, where the forfeiter is the loser.
///
/// # Example
///
/// ```rust
/// use arenacore::arena::rating::update_ratings;
///
/// let update = update_ratings(1500, 1500, 32.0);
/// assert_eq!(update.winner.delta, 16);
/// assert_eq!(update.loser.delta, -16);
/// ```
pub fn update_ratings(winner_rating: i64, loser_rating: i64, k_factor: f64) -> RatingUpdate {
    let expected_winner = expected_score(winner_rating, loser_rating);
    let expected_loser = 1.0 - expected_winner;

    let winner_delta = (k_factor * (1.0 - expected_winner)).round() as i64;
    let loser_delta = (k_factor * (0.0 - expected_loser)).round() as i64;

    RatingUpdate {
        winner: RatingChange {
            old_rating: winner_rating,
            new_rating: winner_rating + winner_delta,
            delta: winner_delta,
        },
        loser: RatingChange {
            old_rating: loser_rating,
            new_rating: loser_rating + loser_delta,
            delta: loser_delta,
        },
    }
}

/// Per-bettor settlement outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub bettor_id: String,
    pub amount: u64,
}

/// Settle a stake pool for a decisive contest outcome. Parimutuel per side:
/// each winning bettor receives `amount + amount/Pw * Pl`, truncated toward
/// zero; the rounding residual is burned rather than refunded or pooled.
/// Losing bettors receive zero. If the winning side has zero bets, losing
/// stakes are retained unclaimed — this function simply returns no payouts
/// for that side.
///
/// # Example
///
/// ```rust
/// use arenacore::arena::model::{Bet, Side};
/// use arenacore::arena::rating::settle_bets;
///
/// let bets = vec![
///     Bet { contest_id: "c".into(), bettor_id: "w1".into(), side: Side::Pro, amount: 100, settled: false, payout: 0 },
///     Bet { contest_id: "c".into(), bettor_id: "l1".into(), side: Side::Con, amount: 300, settled: false, payout: 0 },
/// ];
/// let payouts = settle_bets(&bets, Side::Pro);
/// assert_eq!(payouts[0].amount, 400); // 100 + 100/100 * 300
/// ```
pub fn settle_bets(bets: &[Bet], winning_side: Side) -> Vec<Payout> {
    let pool_winning: u64 = bets
        .iter()
        .filter(|b| b.side == winning_side)
        .map(|b| b.amount)
        .sum();
    let pool_losing: u64 = bets
        .iter()
        .filter(|b| b.side != winning_side)
        .map(|b| b.amount)
        .sum();

    if pool_winning == 0 {
        // Unclaimed pool: losing stakes are retained, nobody is paid.
        return Vec::new();
    }

    bets.iter()
        .filter(|b| b.side == winning_side)
        .map(|b| {
            let share = (b.amount as u128 * pool_losing as u128) / pool_winning as u128;
            Payout {
                bettor_id: b.bettor_id.clone(),
                amount: b.amount + share as u64,
            }
        })
        .collect()
}

/// Settle a tie: every bettor gets their stake back.
pub fn settle_tie(bets: &[Bet]) -> Vec<Payout> {
    bets.iter()
        .map(|b| Payout {
            bettor_id: b.bettor_id.clone(),
            amount: b.amount,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::model::Side;

    #[test]
    fn equal_ratings_split_k_factor_evenly() {
        let update = update_ratings(1500, 1500, 32.0);
        assert_eq!(update.winner.delta, 16);
        assert_eq!(update.loser.delta, -16);
        assert_eq!(update.winner.delta, -update.loser.delta);
    }

    #[test]
    fn winner_delta_is_nonnegative_and_magnitudes_match() {
        for (w, l) in [(1200, 1800), (1800, 1200), (1000, 1000)] {
            let update = update_ratings(w, l, 32.0);
            assert!(update.winner.delta >= 0);
            assert!(update.loser.delta <= 0);
            assert_eq!(update.winner.delta, -update.loser.delta);
        }
    }

    #[test]
    fn underdog_winner_gains_more_than_favorite_would() {
        let upset = update_ratings(1200, 1800, 32.0);
        let expected_win = update_ratings(1800, 1200, 32.0);
        assert!(upset.winner.delta > expected_win.winner.delta);
    }

    fn bet(id: &str, side: Side, amount: u64) -> Bet {
        Bet {
            contest_id: "c1".into(),
            bettor_id: id.into(),
            side,
            amount,
            settled: false,
            payout: 0,
        }
    }

    #[test]
    fn parimutuel_distributes_losing_pool_proportionally() {
        let bets = vec![
            bet("w1", Side::Pro, 100),
            bet("w2", Side::Pro, 300),
            bet("l1", Side::Con, 400),
        ];
        let payouts = settle_bets(&bets, Side::Pro);
        assert_eq!(payouts.len(), 2);
        let w1 = payouts.iter().find(|p| p.bettor_id == "w1").unwrap();
        let w2 = payouts.iter().find(|p| p.bettor_id == "w2").unwrap();
        // w1: 100 + 100/400*400 = 200; w2: 300 + 300/400*400 = 600
        assert_eq!(w1.amount, 200);
        assert_eq!(w2.amount, 600);
    }

    #[test]
    fn parimutuel_truncates_and_burns_remainder() {
        let bets = vec![bet("w1", Side::Pro, 3), bet("l1", Side::Con, 1)];
        let payouts = settle_bets(&bets, Side::Pro);
        // 3 + 3/3*1 = 3 + 1 = 4, exact here; try an inexact split.
        assert_eq!(payouts[0].amount, 4);

        let bets = vec![bet("w1", Side::Pro, 1), bet("l1", Side::Con, 1)];
        let payouts = settle_bets(&bets, Side::Pro);
        // 1 + 1/1*1 = 2, exact again; use three-way pool for truncation.
        assert_eq!(payouts[0].amount, 2);

        let bets = vec![
            bet("w1", Side::Pro, 1),
            bet("w2", Side::Pro, 1),
            bet("w3", Side::Pro, 1),
            bet("l1", Side::Con, 1),
        ];
        let payouts = settle_bets(&bets, Side::Pro);
        // each winner: 1 + 1/3*1 = 1 (integer division truncates to 0 extra)
        for p in &payouts {
            assert_eq!(p.amount, 1);
        }
    }

    #[test]
    fn zero_bets_on_winning_side_pays_nobody() {
        let bets = vec![bet("l1", Side::Con, 400)];
        let payouts = settle_bets(&bets, Side::Pro);
        assert!(payouts.is_empty());
    }

    #[test]
    fn tie_refunds_every_bettor_their_stake() {
        let bets = vec![bet("a", Side::Pro, 50), bet("b", Side::Con, 75)];
        let payouts = settle_tie(&bets);
        assert_eq!(payouts.iter().find(|p| p.bettor_id == "a").unwrap().amount, 50);
        assert_eq!(payouts.iter().find(|p| p.bettor_id == "b").unwrap().amount, 75);
    }
}
