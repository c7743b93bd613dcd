//! Repeatable jobs: definitions, fingerprints and occurrence computation.
//!
//! A definition is persisted under `repeat:<keyHash>` plus a member in the
//! `repeat` zset scored by the next occurrence. Occurrences materialize as
//! delayed jobs with ids `repeat:<keyHash>:<occurrenceMillis>`; at most one
//! is outstanding per series at any time.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use md5::Md5;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};

use crate::error::{ConveyorError, Result};
use crate::options::{JobOptions, QueueSettings, RepeatKeyHashAlgorithm, RepeatOptions};
use crate::scripts::Scripts;

/// Listing entry from `get_repeatable_jobs`.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatableJob {
    pub key: String,
    pub name: String,
    pub end_date: Option<i64>,
    pub tz: Option<String>,
    pub pattern: Option<String>,
    pub every: Option<u64>,
    pub next: i64,
}

/// Scheduler client bound to one queue.
pub struct Repeat {
    scripts: Arc<Scripts>,
    settings: QueueSettings,
}

impl Repeat {
    pub fn new(scripts: Arc<Scripts>, settings: QueueSettings) -> Self {
        Self { scripts, settings }
    }

    /// Validate repeat options at add time. Fails fast, before any store
    /// mutation.
    pub fn validate(opts: &RepeatOptions, now: i64) -> Result<()> {
        if opts.pattern.is_some() && opts.every.is_some() {
            return Err(ConveyorError::ConflictingRepeatOptions);
        }
        if let Some(end) = opts.end_date {
            if end.timestamp_millis() <= now {
                return Err(ConveyorError::EndDateInPast);
            }
        }
        Ok(())
    }

    /// Upsert the definition and materialize the first (or next) occurrence.
    /// Returns the occurrence job id, or `None` when the series is already
    /// exhausted.
    pub async fn upsert(
        &self,
        conn: &mut ConnectionManager,
        name: &str,
        data: &serde_json::Value,
        job_opts: &JobOptions,
        repeat: &RepeatOptions,
        now: i64,
    ) -> Result<Option<String>> {
        Self::validate(repeat, now)?;

        let next = next_occurrence(repeat, name, now, &self.settings)?;
        let Some(next_millis) = next else {
            return Ok(None);
        };

        let raw = fingerprint_string(name, repeat);
        let hashed = hash_key(&raw, self.settings.repeat_key_hash_algorithm);
        let (def_key, legacy_member, legacy_def_key) = match &repeat.key {
            // an explicit key is canonical; migrate any hashed definition
            Some(key) => (key.clone(), hashed.clone(), format!("repeat:{hashed}")),
            None => (hashed, raw, String::new()),
        };

        let occurrence_id = format!("repeat:{def_key}:{next_millis}");
        let mut occurrence_opts = job_opts.clone();
        occurrence_opts.repeat = None;
        occurrence_opts.job_id = None;
        occurrence_opts.delay = 0;

        self.scripts
            .upsert_scheduler(
                conn,
                &def_key,
                next_millis,
                &occurrence_id,
                name,
                &serde_json::to_string(data)?,
                &serde_json::to_string(&occurrence_opts)?,
                &def_fields_json(name, repeat)?,
                &legacy_member,
                &legacy_def_key,
                now,
            )
            .await?;

        tracing::debug!(
            scheduler = %def_key,
            next = next_millis,
            job_id = %occurrence_id,
            "Upserted job scheduler"
        );
        Ok(Some(occurrence_id))
    }

    /// Advance the series after an occurrence was delivered: compute the
    /// occurrence after `job`'s and insert it, idempotently.
    pub async fn advance(
        &self,
        conn: &mut ConnectionManager,
        def_key: &str,
        name: &str,
        data: &serde_json::Value,
        job_opts: &JobOptions,
        now: i64,
    ) -> Result<()> {
        let def: HashMap<String, String> = conn
            .hgetall(self.scripts.keys().repeat_def(def_key))
            .await?;
        if def.is_empty() {
            // definition removed while the occurrence was in flight
            return Ok(());
        }
        let repeat = repeat_options_from_def(&def);
        let delivered: i64 = def
            .get("nextMillis")
            .and_then(|s| s.parse().ok())
            .unwrap_or(now);
        let iterations: u64 = def.get("ic").and_then(|s| s.parse().ok()).unwrap_or(0);

        if let Some(limit) = repeat.limit {
            if iterations >= limit {
                return Ok(());
            }
        }

        let anchor = now.max(delivered);
        let Some(mut next_millis) = next_occurrence(&repeat, name, anchor, &self.settings)?
        else {
            return Ok(());
        };
        if next_millis <= delivered {
            match repeat.every {
                Some(every) => next_millis = delivered + every as i64,
                None => return Ok(()),
            }
        }

        let occurrence_id = format!("repeat:{def_key}:{next_millis}");
        let mut occurrence_opts = job_opts.clone();
        occurrence_opts.repeat = None;
        occurrence_opts.job_id = None;
        occurrence_opts.delay = 0;

        self.scripts
            .upsert_scheduler(
                conn,
                def_key,
                next_millis,
                &occurrence_id,
                name,
                &serde_json::to_string(data)?,
                &serde_json::to_string(&occurrence_opts)?,
                &def_fields_json(name, &repeat)?,
                "",
                "",
                now,
            )
            .await?;
        Ok(())
    }

    /// Remove a definition by key, recognizing both layouts.
    pub async fn remove(&self, conn: &mut ConnectionManager, key: &str) -> Result<bool> {
        let occurrence_prefix = format!("repeat:{key}:");
        self.scripts
            .remove_scheduler(conn, key, key, &occurrence_prefix)
            .await
    }

    /// Remove the definition fingerprinted from `(name, repeat)`.
    pub async fn remove_by_options(
        &self,
        conn: &mut ConnectionManager,
        name: &str,
        repeat: &RepeatOptions,
    ) -> Result<bool> {
        let raw = fingerprint_string(name, repeat);
        let key = match &repeat.key {
            Some(key) => key.clone(),
            None => hash_key(&raw, self.settings.repeat_key_hash_algorithm),
        };
        let occurrence_prefix = format!("repeat:{key}:");
        self.scripts
            .remove_scheduler(conn, &key, &raw, &occurrence_prefix)
            .await
    }

    /// `{key, name, endDate, tz, pattern, every, next}` tuples from the
    /// `repeat` zset joined against the per-definition hashes.
    pub async fn list(
        &self,
        conn: &mut ConnectionManager,
        offset: isize,
        limit: isize,
        asc: bool,
    ) -> Result<Vec<RepeatableJob>> {
        let repeat_key = self.scripts.keys().repeat();
        let end = if limit < 0 { -1 } else { offset + limit - 1 };
        let members: Vec<(String, f64)> = if asc {
            conn.zrange_withscores(&repeat_key, offset, end).await?
        } else {
            conn.zrevrange_withscores(&repeat_key, offset, end).await?
        };

        let mut out = Vec::with_capacity(members.len());
        for (member, score) in members {
            let def: HashMap<String, String> = conn
                .hgetall(self.scripts.keys().repeat_def(&member))
                .await?;
            if def.is_empty() {
                // legacy layout: the member itself is the fingerprint string
                if let Some(job) = parse_legacy_member(&member, score as i64) {
                    out.push(job);
                }
            } else {
                let repeat = repeat_options_from_def(&def);
                out.push(RepeatableJob {
                    key: member,
                    name: def.get("name").cloned().unwrap_or_default(),
                    end_date: repeat.end_date.map(|d| d.timestamp_millis()),
                    tz: repeat.tz,
                    pattern: repeat.pattern,
                    every: repeat.every,
                    next: score as i64,
                });
            }
        }
        Ok(out)
    }
}

/// `name::jobId::endDate::tz::suffix`, suffix = pattern or every. This is
/// also the legacy zset member format.
pub fn fingerprint_string(name: &str, opts: &RepeatOptions) -> String {
    let suffix = match (&opts.pattern, opts.every) {
        (Some(p), _) => p.clone(),
        (None, Some(e)) => e.to_string(),
        (None, None) => String::new(),
    };
    let end_date = opts
        .end_date
        .map(|d| d.timestamp_millis().to_string())
        .unwrap_or_default();
    format!(
        "{}::{}::{}::{}::{}",
        name,
        opts.job_id.as_deref().unwrap_or(""),
        end_date,
        opts.tz.as_deref().unwrap_or(""),
        suffix
    )
}

pub fn hash_key(raw: &str, algorithm: RepeatKeyHashAlgorithm) -> String {
    match algorithm {
        RepeatKeyHashAlgorithm::Md5 => format!("{:x}", Md5::digest(raw.as_bytes())),
        RepeatKeyHashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(raw.as_bytes())),
    }
}

/// Next occurrence strictly after (or at) `now`, or `None` when the series
/// terminates. The `repeatStrategy` hook overrides the default computation.
pub fn next_occurrence(
    opts: &RepeatOptions,
    name: &str,
    now: i64,
    settings: &QueueSettings,
) -> Result<Option<i64>> {
    let next = if let Some(strategy) = &settings.repeat_strategy {
        strategy(now, opts, name)?
    } else if opts.immediately {
        Some(now)
    } else if let Some(every) = opts.every {
        let every = every as i64;
        let anchor = opts
            .start_date
            .map(|d| d.timestamp_millis())
            .unwrap_or(0)
            .min(now);
        let elapsed = now - anchor;
        let slots = (elapsed + every - 1) / every;
        Some(anchor + slots * every)
    } else if let Some(pattern) = &opts.pattern {
        let after = opts
            .start_date
            .map(|d| d.timestamp_millis().max(now))
            .unwrap_or(now);
        cron_next(pattern, opts.tz.as_deref(), after)?
    } else {
        None
    };

    match (next, opts.end_date) {
        (Some(n), Some(end)) if n > end.timestamp_millis() => Ok(None),
        (n, _) => Ok(n),
    }
}

/// Next firing of a cron pattern strictly after `after` (ms). Five-field
/// patterns get a seconds field prepended.
fn cron_next(pattern: &str, tz: Option<&str>, after: i64) -> Result<Option<i64>> {
    let normalized = normalize_pattern(pattern);
    let schedule = cron::Schedule::from_str(&normalized).map_err(|source| {
        ConveyorError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        }
    })?;
    let after_utc = Utc
        .timestamp_millis_opt(after)
        .single()
        .unwrap_or_else(Utc::now);

    let next = match tz {
        Some(tz_name) if !tz_name.is_empty() => {
            let tz: chrono_tz::Tz = tz_name
                .parse()
                .map_err(|_| ConveyorError::UnknownTimezone(tz_name.to_string()))?;
            schedule
                .after(&after_utc.with_timezone(&tz))
                .next()
                .map(|dt| dt.timestamp_millis())
        }
        _ => schedule
            .after(&after_utc)
            .next()
            .map(|dt| dt.timestamp_millis()),
    };
    Ok(next)
}

fn normalize_pattern(pattern: &str) -> String {
    let fields = pattern.split_whitespace().count();
    if fields == 5 {
        format!("0 {pattern}")
    } else {
        pattern.to_string()
    }
}

/// Definition hash fields as JSON for the upsert script. Absent options stay
/// absent; empty strings persist as empty strings.
fn def_fields_json(name: &str, opts: &RepeatOptions) -> Result<String> {
    let mut fields = serde_json::Map::new();
    fields.insert("name".to_string(), name.into());
    if let Some(pattern) = &opts.pattern {
        fields.insert("pattern".to_string(), pattern.clone().into());
    }
    if let Some(every) = opts.every {
        fields.insert("every".to_string(), every.to_string().into());
    }
    if let Some(tz) = &opts.tz {
        fields.insert("tz".to_string(), tz.clone().into());
    }
    if let Some(end) = opts.end_date {
        fields.insert(
            "endDate".to_string(),
            end.timestamp_millis().to_string().into(),
        );
    }
    if let Some(start) = opts.start_date {
        fields.insert(
            "startDate".to_string(),
            start.timestamp_millis().to_string().into(),
        );
    }
    if let Some(limit) = opts.limit {
        fields.insert("limit".to_string(), limit.to_string().into());
    }
    if opts.utc {
        fields.insert("utc".to_string(), "1".into());
    }
    Ok(serde_json::to_string(&serde_json::Value::Object(fields))?)
}

fn repeat_options_from_def(def: &HashMap<String, String>) -> RepeatOptions {
    RepeatOptions {
        pattern: def.get("pattern").cloned(),
        every: def.get("every").and_then(|s| s.parse().ok()),
        tz: def.get("tz").cloned(),
        start_date: def
            .get("startDate")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(millis_to_datetime),
        end_date: def
            .get("endDate")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(millis_to_datetime),
        limit: def.get("limit").and_then(|s| s.parse().ok()),
        immediately: false,
        utc: def.get("utc").map(|v| v == "1").unwrap_or(false),
        job_id: None,
        key: None,
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// `name::jobId::endDate::tz::suffix` legacy members.
fn parse_legacy_member(member: &str, next: i64) -> Option<RepeatableJob> {
    let parts: Vec<&str> = member.split("::").collect();
    if parts.len() != 5 {
        return None;
    }
    let suffix = parts[4];
    let every: Option<u64> = suffix.parse().ok();
    Some(RepeatableJob {
        key: member.to_string(),
        name: parts[0].to_string(),
        end_date: parts[2].parse().ok(),
        tz: (!parts[3].is_empty()).then(|| parts[3].to_string()),
        pattern: every.is_none().then(|| suffix.to_string()),
        every,
        next,
    })
}
