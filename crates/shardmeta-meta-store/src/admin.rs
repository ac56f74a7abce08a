//! Administrative statements understood by the store's `sql` escape hatch.
//!
//! Only idempotent trigger management is supported:
//!
//! ```text
//! DROP TRIGGER IF EXISTS <name> ON <bucket>
//! CREATE TRIGGER <name> ON <bucket> COUNT DIRNAME INTO <bucket>
//! ```
//!
//! A script is any number of statements separated by `;`.

use serde::{Deserialize, Serialize};
use shardmeta_common::{StoreError, StoreResult};
use std::fmt;

/// What a trigger does when a key of its bucket is created or deleted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Keep `entries` of the parent directory's row in `into` up to date
    CountDirname { into: String },
}

/// A trigger bound to one bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDef {
    pub name: String,
    pub bucket: String,
    #[serde(flatten)]
    pub action: TriggerAction,
}

/// One parsed administrative statement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminStatement {
    DropTrigger { name: String, bucket: String },
    CreateTrigger(TriggerDef),
}

impl AdminStatement {
    /// Parse a `;`-separated script
    pub fn parse_script(sql: &str) -> StoreResult<Vec<Self>> {
        let statements: Vec<Self> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect::<StoreResult<_>>()?;
        if statements.is_empty() {
            return Err(StoreError::InvalidQuery("empty statement".to_string()));
        }
        Ok(statements)
    }

    /// Parse one statement
    pub fn parse(sql: &str) -> StoreResult<Self> {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let kw: Vec<&str> = upper.iter().map(String::as_str).collect();

        match kw.as_slice() {
            ["DROP", "TRIGGER", "IF", "EXISTS", _, "ON", _] => Ok(Self::DropTrigger {
                name: words[4].to_string(),
                bucket: words[6].to_string(),
            }),
            ["CREATE", "TRIGGER", _, "ON", _, "COUNT", "DIRNAME", "INTO", _] => {
                Ok(Self::CreateTrigger(TriggerDef {
                    name: words[2].to_string(),
                    bucket: words[4].to_string(),
                    action: TriggerAction::CountDirname {
                        into: words[8].to_string(),
                    },
                }))
            }
            _ => Err(StoreError::InvalidQuery(format!(
                "unsupported statement: {sql}"
            ))),
        }
    }
}

impl fmt::Display for AdminStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropTrigger { name, bucket } => {
                write!(f, "DROP TRIGGER IF EXISTS {name} ON {bucket}")
            }
            Self::CreateTrigger(TriggerDef {
                name,
                bucket,
                action: TriggerAction::CountDirname { into },
            }) => write!(f, "CREATE TRIGGER {name} ON {bucket} COUNT DIRNAME INTO {into}"),
        }
    }
}
