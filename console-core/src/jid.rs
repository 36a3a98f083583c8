//! Helpers for the gateway's chat identifiers (`<user>@<server>`).

pub const GROUP_SERVER: &str = "g.us";

/// Splits a chat id into its user and server parts. A bare number has no server.
pub fn split(id: &str) -> (&str, Option<&str>) {
    match id.trim().split_once('@') {
        Some((user, server)) => (user, Some(server)),
        None => (id.trim(), None),
    }
}

pub fn is_group(id: &str) -> bool {
    matches!(split(id).1, Some(server) if server.eq_ignore_ascii_case(GROUP_SERVER))
}

/// Cache key for a contact or group.
///
/// Contacts are keyed by their bare phone number, so `5511999999999`,
/// `5511999999999@s.whatsapp.net` and `5511999999999:12@c.us` share one
/// entry. Groups keep their full id since their user part is not a number.
pub fn normalize_key(id: &str) -> String {
    if is_group(id) {
        return id.trim().to_ascii_lowercase();
    }
    let (user, _) = split(id);
    let user = user.split(':').next().unwrap_or(user);
    let digits: String = user.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        id.trim().to_string()
    } else {
        digits
    }
}

/// Display name used when no profile name is known.
pub fn placeholder_name(id: &str) -> String {
    if is_group(id) {
        return format!("Group {}", split(id).0);
    }
    let key = normalize_key(id);
    if key.chars().all(|c| c.is_ascii_digit()) && !key.is_empty() {
        format!("+{key}")
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_detection_uses_server_suffix() {
        assert!(is_group("120363025246125244@g.us"));
        assert!(!is_group("5511999999999@s.whatsapp.net"));
        assert!(!is_group("5511999999999"));
    }

    #[test]
    fn test_normalize_key_collapses_contact_forms() {
        assert_eq!(normalize_key("5511999999999"), "5511999999999");
        assert_eq!(normalize_key("5511999999999@s.whatsapp.net"), "5511999999999");
        assert_eq!(normalize_key("5511999999999:12@c.us"), "5511999999999");
        assert_eq!(normalize_key("+55 (11) 99999-9999"), "5511999999999");
        assert_eq!(normalize_key("123-456@g.us"), "123-456@g.us");
    }

    #[test]
    fn test_placeholder_names() {
        assert_eq!(placeholder_name("5511999999999@s.whatsapp.net"), "+5511999999999");
        assert_eq!(placeholder_name("123-456@g.us"), "Group 123-456");
    }
}
