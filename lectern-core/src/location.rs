//! Structural locations inside a chapter and CFI-style book locations.
//!
//! A [`LocationPath`] is a pair of points, each a list of child steps followed by
//! a character offset, e.g. `/4/1:12,/4/1:30`. Even steps address element
//! children (`2` is the first element), odd steps address text nodes. A book
//! location ([`Cfi`]) prefixes the chapter path with the spine step:
//! `epubcfi(/6/4!/4/1:12,/4/1:30)` is spine index 1.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReaderError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathPoint {
    pub steps: Vec<usize>,
    pub offset: usize,
}

impl PathPoint {
    pub fn new(steps: Vec<usize>, offset: usize) -> Self {
        Self { steps, offset }
    }

    /// Index of the addressed block among its siblings, from the first
    /// element step.
    pub fn block_index(&self) -> Option<usize> {
        let first = *self.steps.first()?;
        if first == 0 || first % 2 != 0 {
            return None;
        }
        Some(first / 2 - 1)
    }

    fn parse(input: &str, whole: &str) -> Result<Self, ReaderError> {
        let (steps_part, offset) = match input.rsplit_once(':') {
            Some((steps, offset)) => {
                let offset = offset.parse::<usize>().map_err(|_| {
                    ReaderError::invalid_location(whole, format!("bad offset `{offset}`"))
                })?;
                (steps, offset)
            }
            None => (input, 0),
        };

        let Some(rest) = steps_part.strip_prefix('/') else {
            return Err(ReaderError::invalid_location(
                whole,
                "path points must start with `/`",
            ));
        };

        let steps = rest
            .split('/')
            .map(|step| {
                step.parse::<usize>()
                    .map_err(|_| ReaderError::invalid_location(whole, format!("bad step `{step}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if steps.is_empty() {
            return Err(ReaderError::invalid_location(whole, "empty path"));
        }

        Ok(Self { steps, offset })
    }
}

impl fmt::Display for PathPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            write!(f, "/{step}")?;
        }
        write!(f, ":{}", self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocationPath {
    pub start: PathPoint,
    pub end: PathPoint,
}

impl LocationPath {
    pub fn new(start: PathPoint, end: PathPoint) -> Self {
        Self { start, end }
    }

    pub fn collapsed(point: PathPoint) -> Self {
        Self {
            start: point.clone(),
            end: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

impl FromStr for LocationPath {
    type Err = ReaderError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        match trimmed.split_once(',') {
            Some((start, end)) => Ok(Self {
                start: PathPoint::parse(start.trim(), input)?,
                end: PathPoint::parse(end.trim(), input)?,
            }),
            None => Ok(Self::collapsed(PathPoint::parse(trimmed, input)?)),
        }
    }
}

impl fmt::Display for LocationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_collapsed() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{},{}", self.start, self.end)
        }
    }
}

impl TryFrom<String> for LocationPath {
    type Error = ReaderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LocationPath> for String {
    fn from(value: LocationPath) -> Self {
        value.to_string()
    }
}

/// A book-wide location: spine index plus an optional in-chapter path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfi {
    pub spine_index: usize,
    pub path: Option<LocationPath>,
}

const SPINE_STEP: usize = 6;

impl Cfi {
    pub fn new(spine_index: usize, path: Option<LocationPath>) -> Self {
        Self { spine_index, path }
    }
}

impl FromStr for Cfi {
    type Err = ReaderError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let inner = input
            .trim()
            .strip_prefix("epubcfi(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| ReaderError::invalid_location(input, "expected `epubcfi(...)`"))?;

        let (spine_part, path_part) = match inner.split_once('!') {
            Some((spine, path)) => (spine, Some(path)),
            None => (inner, None),
        };

        let mut steps = spine_part
            .strip_prefix('/')
            .ok_or_else(|| ReaderError::invalid_location(input, "spine step must start with `/`"))?
            .split('/');
        let package = steps.next().and_then(|s| s.parse::<usize>().ok());
        let item = steps.next().and_then(|s| s.parse::<usize>().ok());
        let item = match (package, item, steps.next()) {
            (Some(SPINE_STEP), Some(item), None) if item >= 2 && item % 2 == 0 => item,
            _ => {
                return Err(ReaderError::invalid_location(
                    input,
                    "spine step must look like `/6/<even>`",
                ))
            }
        };

        let path = match path_part.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => Some(path.parse::<LocationPath>()?),
            None => None,
        };

        Ok(Self {
            spine_index: item / 2 - 1,
            path,
        })
    }
}

impl fmt::Display for Cfi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epubcfi(/{}/{}", SPINE_STEP, (self.spine_index + 1) * 2)?;
        if let Some(path) = &self.path {
            write!(f, "!{path}")?;
        }
        write!(f, ")")
    }
}
