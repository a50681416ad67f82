//! Shareable contact-card model and the normalized snapshot embedded in
//! credentials.

use serde::{Deserialize, Serialize};

/// A social account attached to a contact card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialAccount {
    /// Service name, e.g. `"mastodon"`.
    pub service: String,
    /// Handle on the service, e.g. `"@sam"`.
    pub handle: String,
    /// Optional profile URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The user-editable contact card.
///
/// Only the fields the user chose to share end up in a credential; see
/// [`ProfileSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    /// Display name.
    pub display_name: String,
    /// Job title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Organization or employer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Free-form skill tags.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Linked social accounts.
    #[serde(default)]
    pub social_accounts: Vec<SocialAccount>,
    /// Avatar as a `data:` URI, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Normalized projection of a [`ContactCard`] as embedded in credential
/// subjects: trimmed strings, empty entries dropped.
///
/// Immutable once issued; re-normalizing a snapshot is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    /// Display name, trimmed.
    pub display_name: String,
    /// Job title, if non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Organization, if non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Non-empty skill tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    /// Social accounts with a non-empty handle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub social_accounts: Vec<SocialAccount>,
    /// Avatar `data:` URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl From<&ContactCard> for ProfileSnapshot {
    fn from(card: &ContactCard) -> Self {
        Self {
            display_name: card.display_name.trim().to_string(),
            title: card.title.as_deref().and_then(non_empty),
            organization: card.organization.as_deref().and_then(non_empty),
            skills: card.skills.iter().filter_map(|s| non_empty(s)).collect(),
            social_accounts: card
                .social_accounts
                .iter()
                .filter(|a| !a.handle.trim().is_empty())
                .cloned()
                .collect(),
            avatar: card.avatar.as_deref().and_then(non_empty),
        }
    }
}

impl ProfileSnapshot {
    /// Rebuilds a snapshot from a decoded credential subject, tolerating
    /// missing or oddly-typed optional sub-fields. Fails only when no
    /// display name can be recovered at all.
    #[must_use]
    pub fn from_subject(subject: &serde_json::Value) -> Option<Self> {
        let display_name = subject
            .get("displayName")
            .or_else(|| subject.get("name"))
            .and_then(serde_json::Value::as_str)?
            .trim()
            .to_string();
        if display_name.is_empty() {
            return None;
        }

        let string_field = |key: &str| {
            subject.get(key).and_then(serde_json::Value::as_str).and_then(non_empty)
        };

        let skills = subject
            .get("skills")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .filter_map(non_empty)
                    .collect()
            })
            .unwrap_or_default();

        let social_accounts = subject
            .get("socialAccounts")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            display_name,
            title: string_field("title"),
            organization: string_field("organization"),
            skills,
            social_accounts,
            avatar: string_field("avatar").filter(|uri| uri.starts_with("data:")),
        })
    }

    /// Expands the snapshot back into an editable card.
    #[must_use]
    pub fn into_card(self) -> ContactCard {
        ContactCard {
            display_name: self.display_name,
            title: self.title,
            organization: self.organization,
            skills: self.skills,
            social_accounts: self.social_accounts,
            avatar: self.avatar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_normalizes() {
        let card = ContactCard {
            display_name: "  Sam Reyes ".to_string(),
            title: Some("   ".to_string()),
            organization: Some("Acme".to_string()),
            skills: vec!["rust".to_string(), String::new(), " zk ".to_string()],
            social_accounts: vec![SocialAccount {
                service: "mastodon".to_string(),
                handle: String::new(),
                url: None,
            }],
            avatar: None,
        };

        let snapshot = ProfileSnapshot::from(&card);
        assert_eq!(snapshot.display_name, "Sam Reyes");
        assert_eq!(snapshot.title, None);
        assert_eq!(snapshot.skills, vec!["rust", "zk"]);
        assert!(snapshot.social_accounts.is_empty());
    }

    #[test]
    fn test_from_subject_tolerates_missing_fields() {
        let subject = serde_json::json!({ "displayName": "Sam", "skills": ["rust", 7] });
        let snapshot = ProfileSnapshot::from_subject(&subject).unwrap();
        assert_eq!(snapshot.display_name, "Sam");
        assert_eq!(snapshot.skills, vec!["rust"]);
        assert!(snapshot.organization.is_none());
    }

    #[test]
    fn test_from_subject_requires_name() {
        assert!(ProfileSnapshot::from_subject(&serde_json::json!({"title": "CTO"})).is_none());
    }

    #[test]
    fn test_from_subject_rejects_non_data_avatar() {
        let subject = serde_json::json!({
            "displayName": "Sam",
            "avatar": "https://example.com/a.png",
        });
        let snapshot = ProfileSnapshot::from_subject(&subject).unwrap();
        assert!(snapshot.avatar.is_none());
    }
}
