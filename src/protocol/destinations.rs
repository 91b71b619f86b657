//! Destination canonicalization and feed builders
//!
//! Progress arrives on two kinds of destinations: the per-user feed that
//! carries events for every job the user owns, and one feed per crawl job.

use super::messages::WorkId;
use crate::config::DestinationSection;

pub const DEFAULT_USER_FEED: &str = "/user/queue/progress";
pub const DEFAULT_JOB_FEED_PREFIX: &str = "/topic/progress";

pub fn canonicalize_destination(destination: &str) -> String {
    let trimmed = destination.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }

    // Single leading slash
    let mut result = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    // No trailing slash except for the root
    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Builds canonical feed destinations from configured prefixes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationBuilder {
    user_feed: String,
    job_feed_prefix: String,
}

impl DestinationBuilder {
    pub fn new(user_feed: &str, job_feed_prefix: &str) -> Self {
        Self {
            user_feed: canonicalize_destination(user_feed),
            job_feed_prefix: canonicalize_destination(job_feed_prefix),
        }
    }

    pub fn user_feed(&self) -> &str {
        &self.user_feed
    }

    pub fn job_feed(&self, work_id: WorkId) -> String {
        canonicalize_destination(&format!("{}/{work_id}", self.job_feed_prefix))
    }

    /// Extract the job id from a per-job destination
    pub fn parse_job_feed(&self, destination: &str) -> Option<WorkId> {
        let destination = canonicalize_destination(destination);
        let prefix = if self.job_feed_prefix == "/" {
            ""
        } else {
            self.job_feed_prefix.as_str()
        };
        let rest = destination.strip_prefix(prefix)?.strip_prefix('/')?;
        rest.parse().ok()
    }
}

impl Default for DestinationBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_USER_FEED, DEFAULT_JOB_FEED_PREFIX)
    }
}

impl From<&DestinationSection> for DestinationBuilder {
    fn from(section: &DestinationSection) -> Self {
        Self::new(&section.user_feed, &section.job_feed_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_destination_is_idempotent(destination in ".*") {
            let first = canonicalize_destination(&destination);
            let second = canonicalize_destination(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonical_destinations_have_one_leading_slash(destination in ".*") {
            let result = canonicalize_destination(&destination);
            prop_assert!(result.starts_with('/'), "missing leading slash: {}", result);
            prop_assert!(!result.contains("//"), "consecutive slashes: {}", result);
            if result.len() > 1 {
                prop_assert!(!result.ends_with('/'), "trailing slash: {}", result);
            }
        }

        #[test]
        fn job_feed_round_trips_work_id(work_id in any::<i64>()) {
            let builder = DestinationBuilder::default();
            prop_assert_eq!(builder.parse_job_feed(&builder.job_feed(work_id)), Some(work_id));
        }
    }

    #[test]
    fn test_canonicalization_examples() {
        assert_eq!(canonicalize_destination(""), "/");
        assert_eq!(canonicalize_destination("//"), "/");
        assert_eq!(
            canonicalize_destination("user/queue/progress/"),
            "/user/queue/progress"
        );
        assert_eq!(
            canonicalize_destination("//topic//progress//7"),
            "/topic/progress/7"
        );
        assert_eq!(canonicalize_destination("  /topic/x  "), "/topic/x");
    }

    #[test]
    fn test_default_feeds() {
        let builder = DestinationBuilder::default();
        assert_eq!(builder.user_feed(), "/user/queue/progress");
        assert_eq!(builder.job_feed(7), "/topic/progress/7");
    }

    #[test]
    fn test_custom_prefix_is_canonicalized() {
        let builder = DestinationBuilder::new("user/feed/", "jobs//");
        assert_eq!(builder.user_feed(), "/user/feed");
        assert_eq!(builder.job_feed(12), "/jobs/12");
    }

    #[test]
    fn test_parse_job_feed_rejects_foreign_destinations() {
        let builder = DestinationBuilder::default();
        assert_eq!(builder.parse_job_feed("/topic/progress/42"), Some(42));
        assert_eq!(builder.parse_job_feed("/topic/progress/"), None);
        assert_eq!(builder.parse_job_feed("/topic/progressx/1"), None);
        assert_eq!(builder.parse_job_feed("/topic/other/1"), None);
        assert_eq!(builder.parse_job_feed("/topic/progress/abc"), None);
    }
}
