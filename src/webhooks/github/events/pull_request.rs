use serde::Deserialize;

use crate::webhooks::github::events::{GitHubUser, PullRequest, Repository};

/// Actions after which the pull request content may have changed and needs analysing again.
pub const RELAYED_ACTIONS: [&str; 3] = ["opened", "reopened", "synchronize"];

pub fn is_relayed_action(action: &str) -> bool {
    RELAYED_ACTIONS.contains(&action)
}

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub repository: Repository,
    pub sender: GitHubUser,
    pub pull_request: PullRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_content_changing_actions_are_relayed() {
        for action in ["opened", "reopened", "synchronize"] {
            assert!(is_relayed_action(action), "{} should be relayed", action);
        }
        for action in ["closed", "edited", "labeled", "assigned", "Opened", ""] {
            assert!(!is_relayed_action(action), "{} shouldn't be relayed", action);
        }
    }

    #[test]
    fn parses_a_github_payload() {
        let event: PullRequestEvent = serde_json::from_value(serde_json::json!({
            "action": "synchronize",
            "number": 7,
            "sender": { "login": "octocat", "id": 1 },
            "repository": {
                "name": "hello",
                "full_name": "octo/hello",
                "owner": { "login": "octo", "id": 2 },
                "html_url": "https://github.com/octo/hello",
                "private": false
            },
            "pull_request": {
                "number": 7,
                "html_url": "https://github.com/octo/hello/pull/7",
                "title": "Fix the thing",
                "body": null,
                "user": { "login": "octocat", "id": 1 },
                "base": { "ref": "main", "sha": "aaa" },
                "head": { "ref": "fix", "sha": "bbb" },
                "created_at": "2024-01-02T03:04:05Z",
                "updated_at": "2024-01-03T03:04:05Z",
                "draft": false
            }
        }))
        .unwrap();

        assert_eq!(event.action, "synchronize");
        assert_eq!(event.repository.owner.login, "octo");
        assert_eq!(event.pull_request.head.sha, "bbb");
        assert!(event.pull_request.body.is_none());
        assert_eq!(
            event.pull_request.to_string(),
            "PR #7: Fix the thing by octocat"
        );
    }
}
