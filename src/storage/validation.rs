use super::{Error, SNAPSHOT_DELIMITER};

/// Validates a container or custom volume name for ZFS dataset naming rules.
///
/// ZFS dataset components must match [a-zA-Z0-9][a-zA-Z0-9-_:.]*; the
/// delimiter characters '/' and '@' are structural and never valid inside a
/// single component.
pub(crate) fn validate_entity_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid_name(name, "name cannot be empty"));
    }

    if name.len() > 255 {
        return Err(Error::invalid_name(name, "name too long"));
    }

    let first_char = name.chars().next().unwrap();
    if !first_char.is_ascii_alphanumeric() {
        return Err(Error::invalid_name(
            name,
            format!("name cannot begin with '{}'", first_char),
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ':' {
            return Err(Error::invalid_name(
                name,
                format!("invalid character '{}' in name", c),
            ));
        }
    }

    Ok(())
}

/// Splits a manager snapshot label into its container and snapshot parts.
///
/// Labels take the form `container/snapshot`; anything after the first
/// delimiter is the user's snapshot name.
pub(crate) fn parse_snapshot_label(label: &str) -> Result<(&str, &str), Error> {
    match label.split_once(SNAPSHOT_DELIMITER) {
        Some((container, snapshot)) if !container.is_empty() && !snapshot.is_empty() => {
            Ok((container, snapshot))
        }
        _ => Err(Error::invalid_name(label, "not a snapshot label")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_name_validation() {
        assert!(validate_entity_name("valid-name").is_ok());
        assert!(validate_entity_name("web_1").is_ok());
        assert!(validate_entity_name("c123").is_ok());
        assert!(validate_entity_name("123numbers").is_ok());
        assert!(validate_entity_name("a:b.c").is_ok());

        assert!(validate_entity_name("").is_err());
        assert!(validate_entity_name(&"a".repeat(256)).is_err());
        assert!(validate_entity_name("-dash").is_err());
        assert!(validate_entity_name(".dot").is_err());
        assert!(validate_entity_name("has space").is_err());
        assert!(validate_entity_name("has@at").is_err());
        assert!(validate_entity_name("has/slash").is_err());
    }

    #[test]
    fn test_parse_snapshot_label() {
        assert_eq!(parse_snapshot_label("c1/s1").unwrap(), ("c1", "s1"));
        // Only the first delimiter splits; the rest belongs to the snapshot.
        assert_eq!(parse_snapshot_label("c1/s1/x").unwrap(), ("c1", "s1/x"));

        assert!(parse_snapshot_label("c1").is_err());
        assert!(parse_snapshot_label("/s1").is_err());
        assert!(parse_snapshot_label("c1/").is_err());
    }
}
