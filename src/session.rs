//! Transcode requests and session records
//!
//! The session store is the authoritative record of every transcoding
//! request: status, progress, timestamps, error, and the content
//! fingerprint. Sessions are kept in memory and retained after they
//! reach a terminal state so completed and failed runs stay auditable.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::fingerprint::fingerprint_request;

/// Output container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Dash,
    Hls,
    Mp4,
    Mkv,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Dash => "dash",
            Container::Hls => "hls",
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
        }
    }

    /// Whether this container is produced by the streaming pipeline
    pub fn is_streaming(&self) -> bool {
        matches!(self, Container::Dash | Container::Hls)
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target output resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A fully resolved transcoding request
///
/// Immutable for the lifetime of its session. Profile/preset selection
/// happens upstream; the pipeline only consumes resolved parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    /// Absolute path of the source media file
    pub input_path: PathBuf,

    /// Stable library identifier of the media; may be empty, in which
    /// case the input path stands in for it when fingerprinting
    #[serde(default)]
    pub media_id: String,

    pub container: Container,

    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    pub resolution: Resolution,

    /// Video bitrate in kbit/s
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: u32,

    /// Audio bitrate in kbit/s
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,

    /// Quality on a 0..100 scale (mapped to CRF internally)
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Start offset into the source in seconds
    #[serde(default)]
    pub seek_secs: f64,

    /// Prefer a hardware encoder provider when available
    #[serde(default)]
    pub prefer_hardware: bool,
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_video_bitrate() -> u32 {
    3000
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_quality() -> u8 {
    75
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// A transcoding session record
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub provider: String,
    pub fingerprint: String,
    pub request: TranscodeRequest,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Fraction complete, 0.0..=1.0, monotonic while running
    pub progress: f64,
    /// Session output directory
    pub directory: PathBuf,
    /// Manifest URL once known
    pub manifest_url: Option<String>,
}

/// In-memory session store
///
/// Persistence schema details are an external concern; this keeps the
/// authoritative records process-local, with a fingerprint index for
/// session-level deduplication of completed work.
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    completed_by_fingerprint: RwLock<HashMap<String, Uuid>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            completed_by_fingerprint: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new session for a request.
    ///
    /// If a *completed* session with an identical fingerprint already
    /// exists, a clone of that record is returned instead of a fresh
    /// one: content-level deduplication surfaces at the session level.
    pub fn create_session(
        &self,
        provider: &str,
        request: TranscodeRequest,
        sessions_root: &std::path::Path,
    ) -> Session {
        let fingerprint = fingerprint_request(&request);

        if let Some(id) = self.completed_by_fingerprint.read().get(&fingerprint) {
            if let Some(existing) = self.sessions.read().get(id) {
                if existing.status == SessionStatus::Completed {
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        session_id = %existing.id,
                        "Reusing completed session for identical fingerprint"
                    );
                    return existing.clone();
                }
            }
        }

        let id = Uuid::new_v4();
        let session = Session {
            id,
            provider: provider.to_string(),
            fingerprint,
            request,
            status: SessionStatus::Starting,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            progress: 0.0,
            directory: sessions_root.join(id.to_string()),
            manifest_url: None,
        };

        self.sessions.write().insert(id, session.clone());
        session
    }

    /// Get a full session record
    pub fn get_session(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().get(&id).cloned()
    }

    /// List all sessions, newest first
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Update a session's status.
    ///
    /// Idempotent when re-applying the same terminal status; rejects a
    /// transition away from a terminal status.
    pub fn update_status(&self, id: Uuid, status: SessionStatus, message: Option<&str>) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&id)
            .ok_or(PipelineError::SessionNotFound(id))?;

        if session.status.is_terminal() {
            if session.status == status {
                return Ok(());
            }
            return Err(PipelineError::Session(format!(
                "session {} is already {}, cannot become {}",
                id,
                session.status.as_str(),
                status.as_str()
            )));
        }

        if status == SessionStatus::Running && session.started_at.is_none() {
            session.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            session.completed_at = Some(Utc::now());
        }
        if let Some(msg) = message {
            session.error = Some(msg.to_string());
        }
        session.status = status;
        Ok(())
    }

    /// Update progress; only valid while the session is running.
    /// Progress never decreases.
    pub fn update_progress(&self, id: Uuid, progress: f64) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&id)
            .ok_or(PipelineError::SessionNotFound(id))?;

        if session.status != SessionStatus::Running {
            return Err(PipelineError::Session(format!(
                "cannot update progress while session is {}",
                session.status.as_str()
            )));
        }

        session.progress = session.progress.max(progress.clamp(0.0, 1.0));
        Ok(())
    }

    /// Mark a session completed with its result manifest URL.
    pub fn complete_session(&self, id: Uuid, manifest_url: &str) -> Result<()> {
        let fingerprint = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(&id)
                .ok_or(PipelineError::SessionNotFound(id))?;

            if session.status.is_terminal() {
                if session.status == SessionStatus::Completed {
                    return Ok(());
                }
                return Err(PipelineError::Session(format!(
                    "session {} is already {}",
                    id,
                    session.status.as_str()
                )));
            }

            session.status = SessionStatus::Completed;
            session.completed_at = Some(Utc::now());
            session.progress = 1.0;
            session.manifest_url = Some(manifest_url.to_string());
            session.fingerprint.clone()
        };

        self.completed_by_fingerprint.write().insert(fingerprint, id);
        Ok(())
    }

    /// Mark a session failed with an error message.
    pub fn fail_session(&self, id: Uuid, error: &str) -> Result<()> {
        self.update_status(id, SessionStatus::Failed, Some(error))
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_request(container: Container) -> TranscodeRequest {
    TranscodeRequest {
        input_path: PathBuf::from("/media/A.mp4"),
        media_id: "media-1".to_string(),
        container,
        video_codec: "libx264".to_string(),
        audio_codec: "aac".to_string(),
        resolution: Resolution {
            width: 1280,
            height: 720,
        },
        video_bitrate: 3000,
        audio_bitrate: 128,
        quality: 75,
        seek_secs: 0.0,
        prefer_hardware: false,
    }
}
