//! Pub/sub topic helpers (§4.7, §6.2, GLOSSARY "Room / Topic").
//!
//! A topic is keyed by `user:{id}`, `tenant:{id}`, or `conversation:{id}`.

use std::borrow::Cow;

fn norm<S: AsRef<str>>(s: S) -> Cow<'static, str> {
    let mut t = s
        .as_ref()
        .trim()
        .replace([' ', '\t', '\n', '\r', '*', '>', '/', '.'], "-");
    if t.is_empty() {
        t = "unknown".into();
    }
    Cow::Owned(t)
}

/// Direct-delivery topic for a single user, joined at connect time (§4.7 step 1).
pub fn user_topic(user_id: &str) -> String {
    format!("user:{}", norm(user_id))
}

/// Tenant-wide topic, joined when the session carries a tenant (§4.7 step 2).
pub fn tenant_topic(tenant_id: &str) -> String {
    format!("tenant:{}", norm(tenant_id))
}

/// Per-conversation topic every participant subscribes to (§4.7 step 4).
pub fn conversation_topic(conversation_id: &str) -> String {
    format!("conversation:{}", norm(conversation_id))
}

/// Bus key for the online-users set, per tenant or the shared global scope.
pub fn online_set_key(tenant_id: Option<&str>) -> String {
    match tenant_id {
        Some(t) => format!("online:{}", norm(t)),
        None => "online:global".to_string(),
    }
}

/// Bus key for a user's last-seen scalar.
pub fn last_seen_key(user_id: &str) -> String {
    format!("lastSeen:{}", norm(user_id))
}

/// Bus key for a conversation's typing hash.
pub fn typing_key(conversation_id: &str) -> String {
    format!("typing:{}", norm(conversation_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_normalized() {
        assert_eq!(user_topic("user 1"), "user:user-1");
        assert_eq!(tenant_topic(" acme.corp "), "tenant:acme-corp");
        assert_eq!(
            conversation_topic("room/42"),
            "conversation:room-42"
        );
    }

    #[test]
    fn presence_keys() {
        assert_eq!(online_set_key(Some("acme")), "online:acme");
        assert_eq!(online_set_key(None), "online:global");
        assert_eq!(last_seen_key("u1"), "lastSeen:u1");
        assert_eq!(typing_key("c1"), "typing:c1");
    }
}
