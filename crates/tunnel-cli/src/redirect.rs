use anyhow::{Context, Result, bail};
use tunnel_core::Redirect;

/// Host used when a redirect leaves it out.
pub const DEFAULT_HOST: &str = "localhost";

const REDIRECT_FORM: &str = "[remoteHost:]remotePort:[localHost:]localPort";

/// Parse a redirect specification.
///
/// Format: `[remoteHost:]remotePort:[localHost:]localPort`. Both hosts are
/// given or both are omitted; omitted hosts become `localhost`. IPv6 hosts
/// go in brackets.
pub fn parse_redirect(spec: &str) -> Result<Redirect> {
    let fields = split_colon_parts(spec);
    match fields.as_slice() {
        [remote_port, local_port] => Ok(Redirect::new(
            endpoint(DEFAULT_HOST, remote_port)?,
            endpoint(DEFAULT_HOST, local_port)?,
        )),
        [remote_host, remote_port, local_host, local_port] => {
            let local_host = if local_host.is_empty() { DEFAULT_HOST } else { local_host.as_str() };
            Ok(Redirect::new(endpoint(remote_host, remote_port)?, endpoint(local_host, local_port)?))
        }
        [_, _, _] => bail!("invalid redirect {spec}: both remoteHost and localHost must be either present or absent"),
        _ => bail!("invalid redirect {spec}: expected {REDIRECT_FORM}"),
    }
}

/// Split the `SSH_REDIRECTS` list on `/`, skipping blank entries.
pub fn split_redirect_list(value: &str) -> impl Iterator<Item = &str> {
    value.split('/').map(str::trim).filter(|entry| !entry.is_empty())
}

fn endpoint(host: &str, port: &str) -> Result<String> {
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port: {port}"))?;
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

fn split_colon_parts(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0;
    for ch in input.trim().chars() {
        match ch {
            ':' if bracket_depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                if bracket_depth > 0 {
                    bracket_depth -= 1;
                }
                current.push(ch);
            }
            _ => current.push(ch),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_fields_use_localhost_on_both_sides() {
        let redirect = parse_redirect("8080:80").unwrap();
        assert_eq!(redirect.listen, "localhost:8080");
        assert_eq!(redirect.connect, "localhost:80");
    }

    #[test]
    fn four_fields_keep_both_hosts() {
        let redirect = parse_redirect("0.0.0.0:9000:127.0.0.1:80").unwrap();
        assert_eq!(redirect.listen, "0.0.0.0:9000");
        assert_eq!(redirect.connect, "127.0.0.1:80");
    }

    #[test]
    fn empty_remote_host_listens_everywhere() {
        let redirect = parse_redirect(":9000::80").unwrap();
        assert_eq!(redirect.listen, ":9000");
        assert_eq!(redirect.connect, "localhost:80");
    }

    #[test]
    fn bracketed_ipv6_hosts_are_accepted() {
        let redirect = parse_redirect("[::]:9000:[::1]:8080").unwrap();
        assert_eq!(redirect.listen, "[::]:9000");
        assert_eq!(redirect.connect, "[::1]:8080");
    }

    #[test]
    fn three_fields_are_ambiguous() {
        let err = parse_redirect("gateway:9000:80").unwrap_err();
        assert!(
            err.to_string().contains("both remoteHost and localHost must be either present or absent"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn wrong_field_counts_show_the_expected_form() {
        for spec in ["8080", "a:1:b:2:c", ""] {
            let err = parse_redirect(spec).unwrap_err();
            assert!(err.to_string().contains(REDIRECT_FORM), "unexpected error for {spec:?}: {err}");
        }
    }

    #[test]
    fn ports_must_fit_sixteen_bits() {
        assert!(parse_redirect("8080:http").is_err());
        assert!(parse_redirect("70000:80").is_err());
        assert!(parse_redirect("host:9000:host:-1").is_err());
    }

    #[test]
    fn redirect_list_splits_on_slash() {
        let entries: Vec<_> = split_redirect_list("8080:80/ 0.0.0.0:9000:db:5432 //").collect();
        assert_eq!(entries, ["8080:80", "0.0.0.0:9000:db:5432"]);
    }
}
