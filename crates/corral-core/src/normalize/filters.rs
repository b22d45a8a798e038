//! Session filter predicates.
//!
//! All supplied predicates are ANDed together; a session must satisfy every
//! one to match. Absent predicates match everything.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{NormalizedSession, SessionStatus};

/// Filters accepted by `listSessions`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilters {
    /// Exact project match.
    pub project: Option<String>,
    /// Exact repo match.
    pub repo: Option<String>,
    /// Exact status match.
    pub status: Option<SessionStatus>,
    /// Case-insensitive substring match against title and preview.
    pub query: Option<String>,
    /// Inclusive lower bound on createdAt.
    pub created_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on createdAt.
    pub created_before: Option<DateTime<Utc>>,
}

/// Whether `session` satisfies every supplied predicate.
pub fn session_matches_filters(session: &NormalizedSession, filters: &SessionFilters) -> bool {
    if let Some(ref project) = filters.project {
        if session.project.as_deref() != Some(project.as_str()) {
            return false;
        }
    }
    if let Some(ref repo) = filters.repo {
        if session.repo.as_deref() != Some(repo.as_str()) {
            return false;
        }
    }
    if let Some(status) = filters.status {
        if session.status != status {
            return false;
        }
    }
    if let Some(ref query) = filters.query {
        let needle = query.to_lowercase();
        let title = session.title.to_lowercase();
        let preview = session
            .preview
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        if !title.contains(&needle) && !preview.contains(&needle) {
            return false;
        }
    }
    if let Some(after) = filters.created_after {
        if session.created_at < after {
            return false;
        }
    }
    if let Some(before) = filters.created_before {
        if session.created_at > before {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> NormalizedSession {
        NormalizedSession::new("claude", "s1")
            .with_title("Fix login bug")
            .with_project("corral")
            .with_repo("corral/corral")
            .with_preview("investigating the OAuth redirect")
            .with_status(SessionStatus::Active)
    }

    #[test]
    fn test_empty_filters_match_everything() {
        assert!(session_matches_filters(&sample(), &SessionFilters::default()));
    }

    #[test]
    fn test_predicates_are_anded() {
        let filters = SessionFilters {
            project: Some("corral".into()),
            status: Some(SessionStatus::Active),
            ..Default::default()
        };
        assert!(session_matches_filters(&sample(), &filters));

        let filters = SessionFilters {
            project: Some("corral".into()),
            status: Some(SessionStatus::Completed),
            ..Default::default()
        };
        assert!(!session_matches_filters(&sample(), &filters));
    }

    #[test]
    fn test_query_is_case_insensitive_over_title_and_preview() {
        let filters = SessionFilters {
            query: Some("LOGIN".into()),
            ..Default::default()
        };
        assert!(session_matches_filters(&sample(), &filters));

        let filters = SessionFilters {
            query: Some("oauth".into()),
            ..Default::default()
        };
        assert!(session_matches_filters(&sample(), &filters));

        let filters = SessionFilters {
            query: Some("kubernetes".into()),
            ..Default::default()
        };
        assert!(!session_matches_filters(&sample(), &filters));
    }

    #[test]
    fn test_created_range_is_inclusive() {
        let s = sample();
        let filters = SessionFilters {
            created_after: Some(s.created_at),
            created_before: Some(s.created_at),
            ..Default::default()
        };
        assert!(session_matches_filters(&s, &filters));

        let filters = SessionFilters {
            created_after: Some(s.created_at + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!session_matches_filters(&s, &filters));
    }
}
