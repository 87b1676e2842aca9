//! Session correlation: map a hook's external identifiers to an agent.
//!
//! Resolution order:
//! 1. an agent already bound to the session id
//! 2. the most recently registered unbound, live agent in the same working
//!    directory, bound permanently by compare-and-set
//! 3. a new anonymous agent
//!
//! Correlation never fails for lack of a match; it only fails on store
//! errors.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::model::{Agent, NewAgent};
use crate::store::Store;

const BIND_ATTEMPTS: usize = 3;

/// How an agent was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Session,
    Directory,
    Created,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub agent: Agent,
    pub via: Resolution,
}

/// Identifiers carried by an inbound hook.
#[derive(Debug, Clone, Copy)]
pub struct HookIdentity<'a> {
    pub session_id: &'a str,
    pub cwd: &'a str,
    pub pane_id: Option<&'a str>,
    pub transcript_path: Option<&'a str>,
}

pub fn resolve(
    store: &Store,
    identity: HookIdentity<'_>,
    now: DateTime<Utc>,
) -> rusqlite::Result<Resolved> {
    for attempt in 1..=BIND_ATTEMPTS {
        if let Some(agent) = store.agent_by_session(identity.session_id)? {
            return Ok(Resolved {
                agent,
                via: Resolution::Session,
            });
        }

        let Some(candidate) = store.latest_unbound_agent(identity.cwd)? else {
            break;
        };
        if store.bind_session(candidate.id, identity.session_id)? {
            info!(
                agent_id = candidate.id,
                session_id = identity.session_id,
                cwd = identity.cwd,
                "bound session to registered agent"
            );
            let agent = store.agent(candidate.id)?.unwrap_or(candidate);
            return Ok(Resolved {
                agent,
                via: Resolution::Directory,
            });
        }
        debug!(
            agent_id = candidate.id,
            attempt, "agent claimed by another session; retrying"
        );
    }

    // A racing hook for the same session may have created the agent between
    // our lookup and now; the unique session column settles it.
    let created = store.register_agent(
        &NewAgent {
            cwd: identity.cwd.to_string(),
            session_id: Some(identity.session_id.to_string()),
            pane_id: identity.pane_id.map(str::to_string),
            transcript_path: identity.transcript_path.map(str::to_string),
        },
        now,
    );
    match created {
        Ok(agent) => {
            info!(
                agent_id = agent.id,
                session_id = identity.session_id,
                cwd = identity.cwd,
                "created anonymous agent for unknown session"
            );
            Ok(Resolved {
                agent,
                via: Resolution::Created,
            })
        }
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            match store.agent_by_session(identity.session_id)? {
                Some(agent) => Ok(Resolved {
                    agent,
                    via: Resolution::Session,
                }),
                None => Err(rusqlite::Error::SqliteFailure(err, None)),
            }
        }
        Err(e) => Err(e),
    }
}
