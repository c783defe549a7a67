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

//! File-backed repositories. Every file has exactly one owning component;
//! writes go through a temp-file-then-rename replace so readers never see a
//! torn document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{GameResult, Parity, StandingEntry};

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(value).context("failed to encode document")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(Some(value))
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed to read {}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Standings (owner: league manager)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandingsSnapshot {
    pub league_id: String,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    pub rounds_completed: u32,
    pub standings: Vec<StandingEntry>,
}

pub struct StandingsRepository {
    league_id: String,
    path: PathBuf,
}

impl StandingsRepository {
    pub fn new(data_root: impl AsRef<Path>, league_id: &str) -> Self {
        Self {
            league_id: league_id.to_string(),
            path: data_root
                .as_ref()
                .join("leagues")
                .join(league_id)
                .join("standings.json"),
        }
    }

    pub fn load(&self) -> anyhow::Result<StandingsSnapshot> {
        Ok(read_json(&self.path)?.unwrap_or_else(|| StandingsSnapshot {
            league_id: self.league_id.clone(),
            version: 0,
            last_updated: Utc::now(),
            rounds_completed: 0,
            standings: Vec::new(),
        }))
    }

    /// Replaces the table, bumping `version` and `last_updated`.
    pub fn save(&self, standings: Vec<StandingEntry>) -> anyhow::Result<StandingsSnapshot> {
        let mut snapshot = self.load()?;
        snapshot.standings = standings;
        snapshot.version += 1;
        snapshot.last_updated = Utc::now();
        write_json_atomic(&self.path, &snapshot)?;
        Ok(snapshot)
    }

    pub fn increment_rounds_completed(&self) -> anyhow::Result<()> {
        let mut snapshot = self.load()?;
        snapshot.rounds_completed += 1;
        snapshot.version += 1;
        snapshot.last_updated = Utc::now();
        write_json_atomic(&self.path, &snapshot)
    }
}

// ---------------------------------------------------------------------------
// Rounds journal (owner: league manager)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalMatch {
    pub match_id: String,
    #[serde(rename = "player_A_id")]
    pub player_a_id: String,
    #[serde(rename = "player_B_id")]
    pub player_b_id: String,
    pub referee_id: String,
    pub result: Option<GameResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundEntry {
    pub round_id: String,
    pub status: RoundStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub matches: Vec<JournalMatch>,
}

impl RoundEntry {
    pub fn is_complete(&self) -> bool {
        self.matches.iter().all(|m| m.result.is_some())
    }

    pub fn completed_match_ids(&self) -> Vec<String> {
        self.matches
            .iter()
            .filter(|m| m.result.is_some())
            .map(|m| m.match_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundsJournal {
    pub league_id: String,
    pub rounds: Vec<RoundEntry>,
}

pub struct RoundsRepository {
    league_id: String,
    path: PathBuf,
}

impl RoundsRepository {
    pub fn new(data_root: impl AsRef<Path>, league_id: &str) -> Self {
        Self {
            league_id: league_id.to_string(),
            path: data_root
                .as_ref()
                .join("leagues")
                .join(league_id)
                .join("rounds.json"),
        }
    }

    pub fn load(&self) -> anyhow::Result<RoundsJournal> {
        Ok(read_json(&self.path)?.unwrap_or_else(|| RoundsJournal {
            league_id: self.league_id.clone(),
            rounds: Vec::new(),
        }))
    }

    pub fn add_round(&self, round_id: &str, matches: Vec<JournalMatch>) -> anyhow::Result<()> {
        let mut journal = self.load()?;
        journal.rounds.push(RoundEntry {
            round_id: round_id.to_string(),
            status: RoundStatus::InProgress,
            start_time: Some(Utc::now()),
            end_time: None,
            matches,
        });
        write_json_atomic(&self.path, &journal)
    }

    pub fn mark_match_completed(
        &self,
        round_id: &str,
        match_id: &str,
        result: &GameResult,
    ) -> anyhow::Result<()> {
        let mut journal = self.load()?;
        if let Some(round) = journal.rounds.iter_mut().find(|r| r.round_id == round_id)
            && let Some(entry) = round.matches.iter_mut().find(|m| m.match_id == match_id)
        {
            entry.result = Some(result.clone());
        }
        write_json_atomic(&self.path, &journal)
    }

    pub fn mark_round_completed(&self, round_id: &str) -> anyhow::Result<()> {
        let mut journal = self.load()?;
        if let Some(round) = journal.rounds.iter_mut().find(|r| r.round_id == round_id) {
            round.status = RoundStatus::Completed;
            round.end_time = Some(Utc::now());
        }
        write_json_atomic(&self.path, &journal)
    }

    pub fn get_round(&self, round_id: &str) -> anyhow::Result<Option<RoundEntry>> {
        Ok(self
            .load()?
            .rounds
            .into_iter()
            .find(|r| r.round_id == round_id))
    }
}

// ---------------------------------------------------------------------------
// Match records (owner: the refereeing agent)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchState {
    Created,
    WaitingForPlayers,
    CollectingChoices,
    DrawingNumber,
    Finished,
    Cancelled,
}

impl MatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchState::Finished | MatchState::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEntry {
    pub state: MatchState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub message_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPlayers {
    #[serde(rename = "PLAYER_A")]
    pub player_a: String,
    #[serde(rename = "PLAYER_B")]
    pub player_b: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: String,
    pub round_id: String,
    pub league_id: String,
    pub game_type: String,
    pub referee_id: String,
    pub players: MatchPlayers,
    pub lifecycle: Vec<LifecycleEntry>,
    pub transcript: Vec<TranscriptEntry>,
    pub result: Option<GameResult>,
}

impl MatchRecord {
    pub fn new(
        match_id: &str,
        round_id: &str,
        league_id: &str,
        game_type: &str,
        referee_id: &str,
        player_a: &str,
        player_b: &str,
    ) -> Self {
        Self {
            match_id: match_id.to_string(),
            round_id: round_id.to_string(),
            league_id: league_id.to_string(),
            game_type: game_type.to_string(),
            referee_id: referee_id.to_string(),
            players: MatchPlayers {
                player_a: player_a.to_string(),
                player_b: player_b.to_string(),
            },
            lifecycle: vec![LifecycleEntry {
                state: MatchState::Created,
                timestamp: Utc::now(),
            }],
            transcript: Vec::new(),
            result: None,
        }
    }
}

pub struct MatchRepository {
    dir: PathBuf,
}

impl MatchRepository {
    pub fn new(data_root: impl AsRef<Path>, league_id: &str) -> Self {
        Self {
            dir: data_root.as_ref().join("matches").join(league_id),
        }
    }

    fn match_path(&self, match_id: &str) -> PathBuf {
        self.dir.join(format!("match_{match_id}.json"))
    }

    pub fn create(&self, record: &MatchRecord) -> anyhow::Result<()> {
        write_json_atomic(&self.match_path(&record.match_id), record)
    }

    pub fn load(&self, match_id: &str) -> anyhow::Result<Option<MatchRecord>> {
        read_json(&self.match_path(match_id))
    }

    fn update<F: FnOnce(&mut MatchRecord)>(&self, match_id: &str, apply: F) -> anyhow::Result<()> {
        let mut record = self
            .load(match_id)?
            .with_context(|| format!("match {match_id} has no record"))?;
        apply(&mut record);
        write_json_atomic(&self.match_path(match_id), &record)
    }

    pub fn append_transition(
        &self,
        match_id: &str,
        state: MatchState,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.update(match_id, |record| {
            record.lifecycle.push(LifecycleEntry { state, timestamp });
        })
    }

    pub fn append_transcript(
        &self,
        match_id: &str,
        from: &str,
        to: &str,
        message_type: &str,
    ) -> anyhow::Result<()> {
        self.update(match_id, |record| {
            let seq = record.transcript.len() as u32 + 1;
            record.transcript.push(TranscriptEntry {
                seq,
                timestamp: Utc::now(),
                from: from.to_string(),
                to: to.to_string(),
                message_type: message_type.to_string(),
            });
        })
    }

    pub fn save_result(&self, match_id: &str, result: &GameResult) -> anyhow::Result<()> {
        self.update(match_id, |record| {
            record.result = Some(result.clone());
        })
    }
}

// ---------------------------------------------------------------------------
// Player history (owner: the player itself)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchOutcome {
    Win,
    Draw,
    Loss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub match_id: String,
    pub timestamp: DateTime<Utc>,
    pub opponent_id: String,
    pub my_choice: Option<Parity>,
    pub opponent_choice: Option<Parity>,
    pub drawn_number: Option<i64>,
    pub result: MatchOutcome,
    pub points: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStats {
    pub total_matches: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub points: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpponentPattern {
    pub even: u32,
    pub odd: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerHistory {
    pub player_id: String,
    pub stats: PlayerStats,
    pub matches: Vec<HistoryRecord>,
    pub opponent_patterns: BTreeMap<String, OpponentPattern>,
}

pub struct PlayerHistoryRepository {
    player_id: String,
    path: PathBuf,
}

impl PlayerHistoryRepository {
    pub fn new(data_root: impl AsRef<Path>, player_id: &str) -> Self {
        Self {
            player_id: player_id.to_string(),
            path: data_root
                .as_ref()
                .join("players")
                .join(player_id)
                .join("history.json"),
        }
    }

    pub fn load(&self) -> anyhow::Result<PlayerHistory> {
        Ok(read_json(&self.path)?.unwrap_or_else(|| PlayerHistory {
            player_id: self.player_id.clone(),
            stats: PlayerStats::default(),
            matches: Vec::new(),
            opponent_patterns: BTreeMap::new(),
        }))
    }

    pub fn append(&self, record: HistoryRecord) -> anyhow::Result<PlayerHistory> {
        let mut history = self.load()?;

        history.stats.total_matches += 1;
        history.stats.points += record.points;
        match record.result {
            MatchOutcome::Win => history.stats.wins += 1,
            MatchOutcome::Draw => history.stats.draws += 1,
            MatchOutcome::Loss => history.stats.losses += 1,
        }

        if let Some(choice) = record.opponent_choice {
            let pattern = history
                .opponent_patterns
                .entry(record.opponent_id.clone())
                .or_default();
            match choice {
                Parity::Even => pattern.even += 1,
                Parity::Odd => pattern.odd += 1,
            }
        }

        history.matches.push(record);
        write_json_atomic(&self.path, &history)?;
        Ok(history)
    }

    pub fn against(&self, opponent_id: &str) -> anyhow::Result<Vec<HistoryRecord>> {
        Ok(self
            .load()?
            .matches
            .into_iter()
            .filter(|m| m.opponent_id == opponent_id)
            .collect())
    }
}
