//! Port range grammar
//!
//! A port specification is either empty, a single port (`4567`) or an
//! inclusive range (`4567-4569`). Reversed ranges are accepted and swapped.

use crate::ConfigurationError;

/// Parse a single port specification into an ordered list of ports
pub fn parse_port_range(value: &str) -> Result<Vec<u16>, ConfigurationError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(Vec::new());
    }

    let (start, end) = match value.split_once('-') {
        Some((start, end)) => (parse_port(start, value)?, parse_port(end, value)?),
        None => {
            let port = parse_port(value, value)?;
            (port, port)
        }
    };

    let (start, end) = if start > end { (end, start) } else { (start, end) };
    Ok((start..=end).collect())
}

fn parse_port(part: &str, whole: &str) -> Result<u16, ConfigurationError> {
    let number: u64 = part
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::InvalidPort(whole.to_string()))?;
    if number == 0 || number > u16::MAX as u64 {
        return Err(ConfigurationError::PortOutOfRange(number));
    }
    Ok(number as u16)
}

/// Resolve a local/remote pair of port specifications
///
/// A missing side mirrors the other one. Both sides must end up with the
/// same number of ports.
pub fn resolve_ports(local: &str, remote: &str) -> Result<(Vec<u16>, Vec<u16>), ConfigurationError> {
    let mut local_ports = parse_port_range(local)?;
    let mut remote_ports = parse_port_range(remote)?;

    match (local_ports.is_empty(), remote_ports.is_empty()) {
        (true, true) => return Err(ConfigurationError::MissingPorts),
        (true, false) => local_ports = remote_ports.clone(),
        (false, true) => remote_ports = local_ports.clone(),
        (false, false) => {}
    }

    if local_ports.len() != remote_ports.len() {
        return Err(ConfigurationError::PortCountMismatch {
            local: local_ports.len(),
            remote: remote_ports.len(),
        });
    }

    Ok((local_ports, remote_ports))
}

/// Render ports back into the CLI grammar
///
/// Contiguous ascending sequences collapse into `A-B`, anything else is
/// comma separated.
pub fn format_ports(ports: &[u16]) -> String {
    match ports {
        [] => String::new(),
        [single] => single.to_string(),
        [first, .., last] if ports.windows(2).all(|w| w[0].checked_add(1) == Some(w[1])) => {
            format!("{}-{}", first, last)
        }
        _ => ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Sorted ports split into runs of consecutive values
///
/// Each run can be written as a single `P` or `A-B` port option.
pub fn contiguous_runs(ports: &[u16]) -> Vec<Vec<u16>> {
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<Vec<u16>> = Vec::new();
    for port in sorted {
        match runs.last_mut() {
            Some(run) if run.last().and_then(|last| last.checked_add(1)) == Some(port) => {
                run.push(port)
            }
            _ => runs.push(vec![port]),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_port() {
        assert_eq!(parse_port_range("4567").unwrap(), vec![4567]);
    }

    #[test]
    fn test_parse_range_and_reversed_range() {
        assert_eq!(parse_port_range("4567-4569").unwrap(), vec![4567, 4568, 4569]);
        assert_eq!(parse_port_range("4569-4567").unwrap(), vec![4567, 4568, 4569]);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_port_range("").unwrap().is_empty());
        assert!(parse_port_range("  ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(
            parse_port_range("abc"),
            Err(ConfigurationError::InvalidPort("abc".to_string()))
        );
        assert_eq!(
            parse_port_range("70000"),
            Err(ConfigurationError::PortOutOfRange(70000))
        );
        assert_eq!(parse_port_range("0"), Err(ConfigurationError::PortOutOfRange(0)));
        assert!(parse_port_range("1-2-3").is_err());
    }

    #[test]
    fn test_resolve_mirrors_missing_side() {
        let (local, remote) = resolve_ports("4567-4569", "").unwrap();
        assert_eq!(local, vec![4567, 4568, 4569]);
        assert_eq!(remote, vec![4567, 4568, 4569]);

        let (local, remote) = resolve_ports("", "22").unwrap();
        assert_eq!(local, vec![22]);
        assert_eq!(remote, vec![22]);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let first = resolve_ports("4567-4569", "7000-7002").unwrap();
        let second = resolve_ports("4567-4569", "7000-7002").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.1, vec![7000, 7001, 7002]);
    }

    #[test]
    fn test_resolve_both_empty_fails() {
        assert_eq!(resolve_ports("", ""), Err(ConfigurationError::MissingPorts));
    }

    #[test]
    fn test_resolve_cardinality_mismatch() {
        let err = resolve_ports("4567-4569", "7000").unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::PortCountMismatch {
                local: 3,
                remote: 1
            }
        );
        assert!(err.to_string().contains("number of ports should be the same"));
    }

    #[test]
    fn test_format_ports() {
        assert_eq!(format_ports(&[]), "");
        assert_eq!(format_ports(&[4567]), "4567");
        assert_eq!(format_ports(&[4567, 4568, 4569]), "4567-4569");
        assert_eq!(format_ports(&[22, 4567]), "22,4567");
    }

    #[test]
    fn test_contiguous_runs() {
        assert_eq!(
            contiguous_runs(&[443, 80, 81, 82, 443]),
            vec![vec![80, 81, 82], vec![443]]
        );
        assert!(contiguous_runs(&[]).is_empty());
    }
}
