//! Message template substitution
//!
//! Templates carry `{{token}}` placeholders replaced with fields from the
//! outbound lead. The supported tokens are `{{username}}`, `{{firstName}}`,
//! `{{name}}`, and `{{bio}}`; missing fields render as empty strings and no
//! other escaping is performed.

use crate::model::OutboundLead;

/// Derive the first name for a lead: the first whitespace-separated word of
/// its display name, falling back to the username when the name is empty.
pub fn first_name(lead: &OutboundLead) -> String {
    lead.name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .and_then(|name| name.split_whitespace().next())
        .unwrap_or(&lead.username)
        .to_string()
}

/// Render a template against an outbound lead.
pub fn render(template: &str, lead: &OutboundLead) -> String {
    template
        .replace("{{username}}", &lead.username)
        .replace("{{firstName}}", &first_name(lead))
        .replace("{{name}}", lead.name.as_deref().unwrap_or(""))
        .replace("{{bio}}", lead.bio.as_deref().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(username: &str, name: Option<&str>, bio: Option<&str>) -> OutboundLead {
        OutboundLead {
            id: "ol1".to_string(),
            account_id: "a1".to_string(),
            username: username.to_string(),
            name: name.map(str::to_string),
            bio: bio.map(str::to_string),
            followers: None,
            messaged: false,
            replied: false,
            thread_id: None,
            dm_date: None,
            last_message: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_render_all_tokens() {
        let lead = lead("alice_w", Some("Alice Wonder"), Some("explorer"));
        let rendered = render(
            "Hey {{firstName}} ({{username}}), saw \"{{bio}}\" - {{name}}!",
            &lead,
        );
        assert_eq!(rendered, "Hey Alice (alice_w), saw \"explorer\" - Alice Wonder!");
    }

    #[test]
    fn test_first_name_falls_back_to_username() {
        assert_eq!(first_name(&lead("bob99", None, None)), "bob99");
        assert_eq!(first_name(&lead("bob99", Some(""), None)), "bob99");
        assert_eq!(first_name(&lead("bob99", Some("   "), None)), "bob99");
        assert_eq!(first_name(&lead("bob99", Some("Bob Builder"), None)), "Bob");
    }

    #[test]
    fn test_missing_fields_render_empty() {
        let lead = lead("carol", None, None);
        assert_eq!(render("{{name}}|{{bio}}", &lead), "|");
    }

    #[test]
    fn test_no_tokens_is_identity() {
        let lead = lead("dave", Some("Dave"), None);
        assert_eq!(render("plain message", &lead), "plain message");
    }
}
