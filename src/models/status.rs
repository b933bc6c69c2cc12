// src/models/status.rs

//! Compact per-entity fetch progress.
//!
//! Each tracked entity fetches several upstream endpoints independently. Their outcomes are
//! held as a fixed array of [`SlotState`] and rendered to a fixed-width string only when
//! persisted or displayed:
//!
//! ```text
//! S U M N P R      character slots, in declared order
//! S u - N - -      uppercase = success, lowercase = error, '-' = pending
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, Result};

/// Pending marker shared by every layout.
pub const PENDING_CHAR: char = '-';

/// Outcome of one sub-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Pending,
    Success,
    Error,
}

/// A fixed, ordered set of endpoints making up one entity's status string.
pub trait Endpoint: Copy + Eq + fmt::Debug + 'static {
    /// All endpoints in slot order.
    const ALL: &'static [Self];

    /// Slot index of this endpoint.
    fn position(self) -> usize;

    /// Uppercase character written on success.
    fn code(self) -> char;

    /// Upper-snake name, e.g. `"STATUS"`.
    fn name(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.name().eq_ignore_ascii_case(name))
    }

    fn render(self, state: SlotState) -> char {
        match state {
            SlotState::Pending => PENDING_CHAR,
            SlotState::Success => self.code(),
            SlotState::Error => self.code().to_ascii_lowercase(),
        }
    }
}

/// Character sub-fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacterEndpoint {
    Status,
    Summary,
    Media,
    Mounts,
    Pets,
    Professions,
}

impl Endpoint for CharacterEndpoint {
    const ALL: &'static [Self] = &[
        Self::Status,
        Self::Summary,
        Self::Media,
        Self::Mounts,
        Self::Pets,
        Self::Professions,
    ];

    fn position(self) -> usize {
        self as usize
    }

    fn code(self) -> char {
        match self {
            Self::Status => 'S',
            Self::Summary => 'U',
            Self::Media => 'M',
            Self::Mounts => 'N',
            Self::Pets => 'P',
            Self::Professions => 'R',
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::Summary => "SUMMARY",
            Self::Media => "MEDIA",
            Self::Mounts => "MOUNTS",
            Self::Pets => "PETS",
            Self::Professions => "PROFESSIONS",
        }
    }
}

/// Guild sub-fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuildEndpoint {
    Status,
    Summary,
    Roster,
    Achievements,
    Activity,
}

impl Endpoint for GuildEndpoint {
    const ALL: &'static [Self] = &[
        Self::Status,
        Self::Summary,
        Self::Roster,
        Self::Achievements,
        Self::Activity,
    ];

    fn position(self) -> usize {
        self as usize
    }

    fn code(self) -> char {
        match self {
            Self::Status => 'S',
            Self::Summary => 'U',
            Self::Roster => 'R',
            Self::Achievements => 'A',
            Self::Activity => 'V',
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::Summary => "SUMMARY",
            Self::Roster => "ROSTER",
            Self::Achievements => "ACHIEVEMENTS",
            Self::Activity => "ACTIVITY",
        }
    }
}

/// Progress of every sub-fetch for one entity.
#[derive(Clone, PartialEq, Eq)]
pub struct FetchStatus<E: Endpoint> {
    slots: Vec<SlotState>,
    _layout: PhantomData<E>,
}

pub type CharacterStatus = FetchStatus<CharacterEndpoint>;
pub type GuildStatus = FetchStatus<GuildEndpoint>;

impl<E: Endpoint> FetchStatus<E> {
    /// All slots pending.
    pub fn pending() -> Self {
        Self {
            slots: vec![SlotState::Pending; E::ALL.len()],
            _layout: PhantomData,
        }
    }

    /// Parse a status string, rejecting wrong lengths and foreign characters.
    pub fn parse(s: &str) -> Result<Self> {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() != E::ALL.len() {
            return Err(AppError::validation(format!(
                "status '{s}' has {} slots, expected {}",
                chars.len(),
                E::ALL.len()
            )));
        }

        let slots = E::ALL
            .iter()
            .zip(chars)
            .map(|(endpoint, c)| match c {
                PENDING_CHAR => Ok(SlotState::Pending),
                c if c == endpoint.code() => Ok(SlotState::Success),
                c if c == endpoint.code().to_ascii_lowercase() => Ok(SlotState::Error),
                other => Err(AppError::validation(format!(
                    "status '{s}' has '{other}' in the {} slot",
                    endpoint.name()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            slots,
            _layout: PhantomData,
        })
    }

    pub fn set(&mut self, endpoint: E, state: SlotState) {
        self.slots[endpoint.position()] = state;
    }

    pub fn get(&self, endpoint: E) -> SlotState {
        self.slots[endpoint.position()]
    }

    pub fn status_char(&self, endpoint: E) -> char {
        endpoint.render(self.get(endpoint))
    }

    pub fn is_success(&self, endpoint: E) -> bool {
        self.get(endpoint) == SlotState::Success
    }

    pub fn is_error(&self, endpoint: E) -> bool {
        self.get(endpoint) == SlotState::Error
    }

    pub fn is_pending(&self, endpoint: E) -> bool {
        self.get(endpoint) == SlotState::Pending
    }

    /// Share of slots no longer pending, 0..=100.
    pub fn completion_percentage(&self) -> u8 {
        self.percentage(|s| s != SlotState::Pending)
    }

    pub fn success_percentage(&self) -> u8 {
        self.percentage(|s| s == SlotState::Success)
    }

    pub fn error_percentage(&self) -> u8 {
        self.percentage(|s| s == SlotState::Error)
    }

    fn percentage(&self, pred: impl Fn(SlotState) -> bool) -> u8 {
        let hits = self.slots.iter().copied().filter(|s| pred(*s)).count();
        ((hits as f64 / self.slots.len() as f64) * 100.0).round() as u8
    }
}

impl<E: Endpoint> Default for FetchStatus<E> {
    fn default() -> Self {
        Self::pending()
    }
}

impl<E: Endpoint> fmt::Display for FetchStatus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (endpoint, state) in E::ALL.iter().zip(&self.slots) {
            write!(f, "{}", endpoint.render(*state))?;
        }
        Ok(())
    }
}

impl<E: Endpoint> fmt::Debug for FetchStatus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FetchStatus({self})")
    }
}

impl<E: Endpoint> FromStr for FetchStatus<E> {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<E: Endpoint> Serialize for FetchStatus<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, E: Endpoint> Deserialize<'de> for FetchStatus<E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// String-level operations for callers that hold the persisted column directly.

/// Set one slot of a status string and return the new string.
pub fn set_status_string<E: Endpoint>(s: &str, endpoint: E, state: SlotState) -> Result<String> {
    let mut status = FetchStatus::<E>::parse(s)?;
    status.set(endpoint, state);
    Ok(status.to_string())
}

pub fn get_status_char<E: Endpoint>(s: &str, endpoint: E) -> Result<char> {
    Ok(FetchStatus::<E>::parse(s)?.status_char(endpoint))
}

pub fn is_success<E: Endpoint>(s: &str, endpoint: E) -> Result<bool> {
    Ok(FetchStatus::<E>::parse(s)?.is_success(endpoint))
}

pub fn is_error<E: Endpoint>(s: &str, endpoint: E) -> Result<bool> {
    Ok(FetchStatus::<E>::parse(s)?.is_error(endpoint))
}

pub fn is_pending<E: Endpoint>(s: &str, endpoint: E) -> Result<bool> {
    Ok(FetchStatus::<E>::parse(s)?.is_pending(endpoint))
}

pub fn completion_percentage<E: Endpoint>(s: &str) -> Result<u8> {
    Ok(FetchStatus::<E>::parse(s)?.completion_percentage())
}

pub fn success_percentage<E: Endpoint>(s: &str) -> Result<u8> {
    Ok(FetchStatus::<E>::parse(s)?.success_percentage())
}

pub fn error_percentage<E: Endpoint>(s: &str) -> Result<u8> {
    Ok(FetchStatus::<E>::parse(s)?.error_percentage())
}
