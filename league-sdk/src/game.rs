// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Even/Odd rules: a pure mapping from the two parity choices and the drawn
//! number to an outcome with per-player scores.

use std::collections::BTreeMap;

use rand::Rng;

use crate::config::ScoringConfig;
use crate::messages::{GameResult, GameStatus, Parity};

#[derive(Debug, Clone)]
pub struct EvenOddRules {
    pub number_range: [i64; 2],
    pub draw_on_both_wrong: bool,
    pub scoring: ScoringConfig,
}

impl EvenOddRules {
    pub fn new(number_range: [i64; 2], draw_on_both_wrong: bool, scoring: ScoringConfig) -> Self {
        Self {
            number_range,
            draw_on_both_wrong,
            scoring,
        }
    }

    pub fn draw_number(&self) -> i64 {
        rand::rng().random_range(self.number_range[0]..=self.number_range[1])
    }

    pub fn parity_of(number: i64) -> Parity {
        if number % 2 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }

    /// Decide the match from both choices and a drawn number.
    ///
    /// Same choices are a draw (configurably also when both are wrong);
    /// otherwise the player matching the drawn parity wins.
    pub fn decide(
        &self,
        player_a: &str,
        player_b: &str,
        choice_a: Parity,
        choice_b: Parity,
        drawn_number: i64,
    ) -> GameResult {
        let number_parity = Self::parity_of(drawn_number);
        let choices = BTreeMap::from([
            (player_a.to_string(), choice_a),
            (player_b.to_string(), choice_b),
        ]);

        if choice_a == choice_b {
            let both_correct = choice_a == number_parity;
            let (points, qualifier) = if both_correct || self.draw_on_both_wrong {
                (self.scoring.draw_points, if both_correct { "is" } else { "is not" })
            } else {
                (0, "is not")
            };
            return GameResult {
                status: GameStatus::Draw,
                winner_player_id: None,
                drawn_number: Some(drawn_number),
                number_parity: Some(number_parity),
                choices: Some(choices),
                reason: format!(
                    "both players chose '{}' and number {} {} {}",
                    choice_a.as_str(),
                    drawn_number,
                    qualifier,
                    choice_a.as_str(),
                ),
                score: BTreeMap::from([
                    (player_a.to_string(), points),
                    (player_b.to_string(), points),
                ]),
            };
        }

        let (winner, loser, winning_choice) = if choice_a == number_parity {
            (player_a, player_b, choice_a)
        } else {
            (player_b, player_a, choice_b)
        };

        GameResult {
            status: GameStatus::Win,
            winner_player_id: Some(winner.to_string()),
            drawn_number: Some(drawn_number),
            number_parity: Some(number_parity),
            choices: Some(choices),
            reason: format!(
                "{} chose '{}', number {} is {}",
                winner,
                winning_choice.as_str(),
                drawn_number,
                number_parity.as_str(),
            ),
            score: BTreeMap::from([
                (winner.to_string(), self.scoring.win_points),
                (loser.to_string(), self.scoring.loss_points),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> EvenOddRules {
        EvenOddRules::new([0, 99], true, ScoringConfig::default())
    }

    #[test]
    fn correct_parity_wins_three_zero() {
        let result = rules().decide("P01", "P02", Parity::Even, Parity::Odd, 4);
        assert_eq!(result.status, GameStatus::Win);
        assert_eq!(result.winner_player_id.as_deref(), Some("P01"));
        assert_eq!(result.number_parity, Some(Parity::Even));
        assert_eq!(result.score["P01"], 3);
        assert_eq!(result.score["P02"], 0);
    }

    #[test]
    fn odd_number_flips_the_winner() {
        let result = rules().decide("P01", "P02", Parity::Even, Parity::Odd, 7);
        assert_eq!(result.winner_player_id.as_deref(), Some("P02"));
        assert_eq!(result.score["P02"], 3);
        assert_eq!(result.score["P01"], 0);
    }

    #[test]
    fn same_wrong_choice_still_draws_by_default() {
        let result = rules().decide("P01", "P02", Parity::Even, Parity::Even, 7);
        assert_eq!(result.status, GameStatus::Draw);
        assert_eq!(result.winner_player_id, None);
        assert_eq!(result.score["P01"], 1);
        assert_eq!(result.score["P02"], 1);
    }

    #[test]
    fn same_correct_choice_draws() {
        let result = rules().decide("P01", "P02", Parity::Odd, Parity::Odd, 9);
        assert_eq!(result.status, GameStatus::Draw);
        assert_eq!(result.score["P01"], 1);
        assert_eq!(result.score["P02"], 1);
    }

    #[test]
    fn both_wrong_scores_zero_when_draw_on_both_wrong_is_off() {
        let rules = EvenOddRules::new([0, 99], false, ScoringConfig::default());
        let result = rules.decide("P01", "P02", Parity::Even, Parity::Even, 7);
        assert_eq!(result.status, GameStatus::Draw);
        assert_eq!(result.score["P01"], 0);
        assert_eq!(result.score["P02"], 0);
    }

    #[test]
    fn drawn_numbers_stay_inside_the_configured_range() {
        let rules = EvenOddRules::new([1, 10], true, ScoringConfig::default());
        for _ in 0..200 {
            let n = rules.draw_number();
            assert!((1..=10).contains(&n));
        }
    }

    #[test]
    fn awarded_points_sum_to_a_permitted_outcome_total() {
        let rules = rules();
        for drawn in [0, 1, 4, 7] {
            for (a, b) in [
                (Parity::Even, Parity::Odd),
                (Parity::Even, Parity::Even),
                (Parity::Odd, Parity::Odd),
                (Parity::Odd, Parity::Even),
            ] {
                let result = rules.decide("P01", "P02", a, b, drawn);
                let total: i64 = result.score.values().sum();
                match result.status {
                    GameStatus::Win => assert_eq!(total, 3),
                    GameStatus::Draw => assert_eq!(total, 2),
                    GameStatus::Cancelled => unreachable!(),
                }
            }
        }
    }
}
