//! OID helpers shared by the switch drivers.

use crate::error::{Error, Result};

/// Takes a full OID ending in a MAC address and returns the MAC as
/// lowercase hex with no separators. The MAC must occupy the last 6
/// components, each in 0..=255.
pub fn mac_from_oid(oid: &str) -> Result<String> {
    let parts: Vec<&str> = oid.split('.').filter(|p| !p.is_empty()).collect();
    if parts.len() < 6 {
        return Err(Error::OidParse(format!(
            "OID {oid} has fewer than 6 parts; this cannot contain a MAC address"
        )));
    }

    let mut mac = String::with_capacity(12);
    for part in &parts[parts.len() - 6..] {
        let val: u32 = part
            .parse()
            .map_err(|_| Error::OidParse(format!("{part} is not a number")))?;
        if val > 255 {
            return Err(Error::OidParse(format!(
                "{part} is >255, which is invalid in MAC addresses"
            )));
        }
        mac.push_str(&format!("{val:02x}"));
    }

    Ok(mac)
}

/// Returns the final component of an OID.
pub fn last_component(oid: &str) -> Option<&str> {
    oid.rsplit('.').next().filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_mac_from_oid() {
        let mac = mac_from_oid("1.3.6.1.2.1.17.7.1.2.2.1.2.1.164.191.0.43.110.255").unwrap();
        assert_eq!(mac, "a4bf002b6eff");
    }

    #[test]
    fn test_mac_from_oid_exactly_six() {
        assert_eq!(mac_from_oid("0.28.237.192.255.238").unwrap(), "001cedc0ffee");
    }

    #[test]
    fn test_mac_from_oid_too_short() {
        assert_matches!(mac_from_oid("1.2.3.4.5"), Err(Error::OidParse(_)));
    }

    #[test]
    fn test_mac_from_oid_component_too_large() {
        assert_matches!(
            mac_from_oid("1.3.6.1.2.1.164.191.0.43.110.256"),
            Err(Error::OidParse(_))
        );
    }

    #[test]
    fn test_mac_from_oid_non_numeric() {
        assert_matches!(
            mac_from_oid("1.3.6.1.2.1.164.191.zero.43.110.255"),
            Err(Error::OidParse(_))
        );
    }

    #[test]
    fn test_last_component() {
        assert_eq!(last_component("1.3.6.1.2.1.31.1.1.1.1.42"), Some("42"));
        assert_eq!(last_component("7"), Some("7"));
        assert_eq!(last_component(""), None);
    }
}
