//! Data-connection setup and transfer commands

use std::net::{IpAddr, Ipv4Addr};

// Command builders

/// Build TYPE I (binary) command
pub fn type_binary() -> &'static str {
    "TYPE I"
}

/// Build TYPE A (ASCII) command
pub fn type_ascii() -> &'static str {
    "TYPE A"
}

/// Build PASV command
pub fn pasv() -> &'static str {
    "PASV"
}

/// Build EPSV command (RFC 2428 §3)
pub fn epsv() -> &'static str {
    "EPSV"
}

/// Build PORT command from a pre-formatted argument
pub fn port(argument: &str) -> String {
    format!("PORT {}", argument)
}

/// Build EPRT command from a pre-formatted argument (RFC 2428 §2)
pub fn eprt(argument: &str) -> String {
    format!("EPRT {}", argument)
}

/// Build REST command
pub fn rest(offset: u64) -> String {
    format!("REST {}", offset)
}

/// Build RETR command
pub fn retr(file: &str) -> String {
    format!("RETR {}", file)
}

/// Build STOR command
pub fn stor(file: &str) -> String {
    format!("STOR {}", file)
}

/// Build APPE command, the resume fallback for servers without REST STREAM
pub fn appe(file: &str) -> String {
    format!("APPE {}", file)
}

/// Build LIST command
pub fn list() -> &'static str {
    "LIST"
}

/// Build LIST -a command (hidden files included, where supported)
pub fn list_hidden() -> &'static str {
    "LIST -a"
}

/// Build MLSD command (RFC 3659 §7)
pub fn mlsd() -> &'static str {
    "MLSD"
}

/// Build PRET command for distributed servers that must prepare a transfer
/// before PASV
pub fn pret(transfer_command: &str) -> String {
    format!("PRET {}", transfer_command)
}

// Reply parsers and argument formatting

/// Parse a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply
///
/// Returns the advertised host and port. The numbers may appear anywhere in
/// the reply text with or without parentheses; each octet must fit in a
/// byte, and `port = p1 * 256 + p2`.
pub fn parse_pasv_reply(text: &str) -> Option<(Ipv4Addr, u16)> {
    // Scan for the first run of digits-and-commas that yields six octets.
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b',') {
            end += 1;
        }
        let run = &text[start..end];
        let run = run.trim_end_matches(',');
        let parts: Vec<&str> = run.split(',').collect();
        if parts.len() == 6 {
            let mut values = [0u16; 6];
            let mut ok = true;
            for (i, part) in parts.iter().enumerate() {
                match part.parse::<u16>() {
                    Ok(v) if v <= 255 => values[i] = v,
                    _ => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                let host = Ipv4Addr::new(
                    values[0] as u8,
                    values[1] as u8,
                    values[2] as u8,
                    values[3] as u8,
                );
                let port = values[4] * 256 + values[5];
                return Some((host, port));
            }
        }
        start = end.max(start + 1);
    }
    None
}

/// Parse a `229 Entering Extended Passive Mode (|||port|)` reply
///
/// Only the port is carried; the data connection goes to the control peer.
pub fn parse_epsv_reply(text: &str) -> Option<u16> {
    let open = text.find("(|||")?;
    let rest = &text[open + 4..];
    let close = rest.find("|)")?;
    if close == 0 {
        return None;
    }
    let port: u32 = rest[..close].parse().ok()?;
    if port == 0 || port > 65535 {
        return None;
    }
    Some(port as u16)
}

/// Format the PORT argument `h1,h2,h3,h4,p1,p2`
pub fn format_port_argument(addr: Ipv4Addr, port: u16) -> String {
    let o = addr.octets();
    format!(
        "{},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port / 256,
        port % 256
    )
}

/// Format the EPRT argument `|proto|addr|port|`
pub fn format_eprt_argument(addr: IpAddr, port: u16) -> String {
    let proto = match addr {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    format!("|{}|{}|{}|", proto, addr, port)
}

/// Whether an address is routable from the public internet
///
/// Used to spot PASV replies pointing into the server's private network.
pub fn is_routable_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || (o[0] == 100 && (64..128).contains(&o[1])))
        }
        IpAddr::V6(v6) => {
            // fc00::/7 unique local, fe80::/10 link local
            let seg = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        assert_eq!(rest(1000), "REST 1000");
        assert_eq!(retr("a.txt"), "RETR a.txt");
        assert_eq!(stor("a.txt"), "STOR a.txt");
        assert_eq!(appe("a.txt"), "APPE a.txt");
        assert_eq!(pret("RETR a.txt"), "PRET RETR a.txt");
        assert_eq!(port("10,0,0,1,4,1"), "PORT 10,0,0,1,4,1");
        assert_eq!(eprt("|2|::1|5000|"), "EPRT |2|::1|5000|");
    }

    #[test]
    fn test_parse_pasv() {
        let (host, pasv_port) =
            parse_pasv_reply("227 Entering Passive Mode (127,0,0,1,200,1)").unwrap();
        assert_eq!(host, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(pasv_port, 200 * 256 + 1);

        // Without parentheses
        let (host, pasv_port) = parse_pasv_reply("227 PASV ok 10,1,2,3,4,5").unwrap();
        assert_eq!(host, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(pasv_port, 4 * 256 + 5);

        // Leading zeros are accepted
        let (host, _) = parse_pasv_reply("227 (010,001,002,003,0,21)").unwrap();
        assert_eq!(host, Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn test_parse_pasv_rejects_garbage() {
        assert!(parse_pasv_reply("227 nothing here").is_none());
        assert!(parse_pasv_reply("227 (1,2,3,4,5)").is_none());
        assert!(parse_pasv_reply("227 (300,0,0,1,2,3)").is_none());
    }

    #[test]
    fn test_parse_pasv_skips_early_numbers() {
        // The reply code itself must not confuse the scan
        let (host, port) = parse_pasv_reply("227 =127,0,0,1,10,20").unwrap();
        assert_eq!(host, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(port, 10 * 256 + 20);
    }

    #[test]
    fn test_parse_epsv() {
        assert_eq!(
            parse_epsv_reply("229 Entering Extended Passive Mode (|||51201|)"),
            Some(51201)
        );
        assert_eq!(parse_epsv_reply("229 (|||1|)"), Some(1));
        assert_eq!(parse_epsv_reply("229 (|||65535|)"), Some(65535));
    }

    #[test]
    fn test_parse_epsv_rejects_out_of_range() {
        assert_eq!(parse_epsv_reply("229 (|||0|)"), None);
        assert_eq!(parse_epsv_reply("229 (|||65536|)"), None);
        assert_eq!(parse_epsv_reply("229 (|||x|)"), None);
        assert_eq!(parse_epsv_reply("229 no marker"), None);
    }

    #[test]
    fn test_format_port_argument() {
        assert_eq!(
            format_port_argument(Ipv4Addr::new(192, 168, 1, 10), 51201),
            "192,168,1,10,200,1"
        );
    }

    #[test]
    fn test_pasv_port_round_trip() {
        for port in [1u16, 80, 255, 256, 51201, 65535] {
            let arg = format_port_argument(Ipv4Addr::new(1, 2, 3, 4), port);
            let reply = format!("227 ({arg})");
            let (_, parsed) = parse_pasv_reply(&reply).unwrap();
            assert_eq!(parsed, port);
        }
    }

    #[test]
    fn test_format_eprt_argument() {
        assert_eq!(
            format_eprt_argument(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000),
            "|1|10.0.0.1|5000|"
        );
        assert_eq!(
            format_eprt_argument("2001:db8::1".parse().unwrap(), 5000),
            "|2|2001:db8::1|5000|"
        );
    }

    #[test]
    fn test_routable_addresses() {
        let routable: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(is_routable_address(&routable));

        for addr in ["127.0.0.1", "10.0.0.1", "192.168.1.1", "172.16.0.1", "169.254.1.1", "100.64.0.1"] {
            let addr: IpAddr = addr.parse().unwrap();
            assert!(!is_routable_address(&addr), "{addr} should not be routable");
        }

        let ula: IpAddr = "fd00::1".parse().unwrap();
        assert!(!is_routable_address(&ula));
        let global6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(is_routable_address(&global6));
    }
}
