//! Process-wide configuration, threaded explicitly through every component
//! instead of kept as globals.
//!
//! This replaces the original's process-wide `static const char *GUILD_ID`
//! (`examples/original_source/src/dcfs.c`) and the teacher's implicit
//! reliance on a single `&Http` borrowed for the process lifetime — see
//! Design Notes, "process-wide singletons".

use std::env;

use crate::error::DcfsError;
use crate::snowflake::Snowflake;

/// `PART_SIZE`: default 10 MiB, overridable at build time.
pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;
/// `BATCH_SIZE`: attachments per `create-attachments` call.
pub const BATCH_SIZE: usize = 10;
/// `MAX_PARTS`: hard cap on parts per logical file.
pub const DEFAULT_MAX_PARTS: usize = 256;

const TOKEN_MAX_LEN: usize = 100;
const GUILD_ID_MAX_LEN: usize = 48;

/// Upload limits, split out of `Context` so tests can shrink them (spec S3,
/// S6 both rely on overriding `PART_SIZE`/`MAX_PARTS`).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub part_size: usize,
    pub batch_size: usize,
    pub max_parts: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            part_size: option_env!("DCFS_PART_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PART_SIZE),
            batch_size: BATCH_SIZE,
            max_parts: option_env!("DCFS_MAX_PARTS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_PARTS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Context {
    pub token: String,
    pub guild_id: Snowflake,
    pub base_url: String,
    pub limits: Limits,
    pub uid: u32,
    pub gid: u32,
}

impl Context {
    /// Reads `DCFS_TOKEN` and `DCFS_GUILD_ID` from the environment, per
    /// spec §6. Either being unset or over-length is a startup failure.
    pub fn from_env() -> Result<Self, DcfsError> {
        let token = env::var("DCFS_TOKEN")
            .map_err(|_| DcfsError::Invalid)
            .and_then(|t| {
                if t.len() > TOKEN_MAX_LEN {
                    Err(DcfsError::Invalid)
                } else {
                    Ok(t)
                }
            })?;

        let guild_id_raw = env::var("DCFS_GUILD_ID")
            .map_err(|_| DcfsError::Invalid)
            .and_then(|g| {
                if g.len() > GUILD_ID_MAX_LEN {
                    Err(DcfsError::Invalid)
                } else {
                    Ok(g)
                }
            })?;
        let guild_id: Snowflake = guild_id_raw.parse()?;

        Ok(Context {
            token,
            guild_id,
            base_url: "https://discord.com/api/v9".to_string(),
            limits: Limits::default(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_spec_constants() {
        let limits = Limits::default();
        assert_eq!(limits.batch_size, 10);
        // only check defaults when no override env var is compiled in
        if option_env!("DCFS_PART_SIZE").is_none() {
            assert_eq!(limits.part_size, DEFAULT_PART_SIZE);
        }
        if option_env!("DCFS_MAX_PARTS").is_none() {
            assert_eq!(limits.max_parts, DEFAULT_MAX_PARTS);
        }
    }
}
