//! Configuration file parser for `[Interface]` and `[Peer]` sections

use std::net::SocketAddr;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::{IpNet, Ipv4Net};

use crate::error::ConfigError;

/// Complete parsed configuration
#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

/// The local interface section
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Static private key
    pub private_key: [u8; 32],
    /// Tunnel addresses with prefix length
    pub address: Vec<Ipv4Net>,
    /// UDP listen port; absent means ephemeral
    pub listen_port: Option<u16>,
    /// Interface MTU (default 1420)
    pub mtu: Option<u16>,
}

/// One remote peer section
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(PartialEq)]
enum Section {
    None,
    Interface,
    Peer,
}

fn decode_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })
}

impl WireGuardConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut section = Section::None;

        for (idx, raw) in content.lines().enumerate() {
            let line_num = idx + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                section = Section::Interface;
                interface.get_or_insert_with(|| InterfaceConfig {
                    private_key: [0u8; 32],
                    address: Vec::new(),
                    listen_port: None,
                    mtu: None,
                });
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                section = Section::Peer;
                peers.push(PeerConfig {
                    public_key: [0u8; 32],
                    preshared_key: None,
                    endpoint: None,
                    allowed_ips: Vec::new(),
                    persistent_keepalive: None,
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("expected 'key = value', got: {line}"),
                });
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match section {
                Section::Interface => {
                    let iface = interface.as_mut().expect("interface section open");
                    match key.as_str() {
                        "privatekey" => iface.private_key = decode_key(value, "PrivateKey")?,
                        "address" => {
                            for part in value.split(',') {
                                let net: Ipv4Net = part.trim().parse().map_err(|_| {
                                    ConfigError::InvalidCidr {
                                        value: part.trim().to_string(),
                                    }
                                })?;
                                iface.address.push(net);
                            }
                        }
                        "listenport" => {
                            iface.listen_port =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid ListenPort: {value}"),
                                })?);
                        }
                        "mtu" => {
                            iface.mtu =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid MTU: {value}"),
                                })?);
                        }
                        // routing and resolver directives belong to the
                        // configurator, not the engine
                        "dns" | "table" | "preup" | "postup" | "predown" | "postdown" => {}
                        _ => {
                            return Err(ConfigError::ParseError {
                                line: line_num,
                                message: format!("unknown interface key: {key}"),
                            });
                        }
                    }
                }
                Section::Peer => {
                    let peer = peers.last_mut().expect("peer section open");
                    match key.as_str() {
                        "publickey" => peer.public_key = decode_key(value, "PublicKey")?,
                        "presharedkey" => {
                            peer.preshared_key = Some(decode_key(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint =
                                Some(value.parse().map_err(|_| ConfigError::InvalidAddress {
                                    value: value.to_string(),
                                })?);
                        }
                        "allowedips" => {
                            for part in value.split(',') {
                                let net: IpNet = part.trim().parse().map_err(|_| {
                                    ConfigError::InvalidCidr {
                                        value: part.trim().to_string(),
                                    }
                                })?;
                                peer.allowed_ips.push(net.trunc());
                            }
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid PersistentKeepalive: {value}"),
                                })?);
                        }
                        _ => {
                            return Err(ConfigError::ParseError {
                                line: line_num,
                                message: format!("unknown peer key: {key}"),
                            });
                        }
                    }
                }
                Section::None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "key outside of a section".to_string(),
                    });
                }
            }
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface]".to_string(),
        })?;
        if interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }
        for peer in &peers {
            if peer.public_key == [0u8; 32] {
                return Err(ConfigError::MissingField {
                    field: "PublicKey".to_string(),
                });
            }
        }

        Ok(Self { interface, peers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::x25519;

    fn key_b64() -> String {
        let (private, _) = x25519::generate_keypair();
        BASE64.encode(private)
    }

    #[test]
    fn parses_full_config() {
        let config = format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = 10.0.0.1/24\n\
             ListenPort = 51820\n\
             MTU = 1380\n\
             \n\
             # a peer\n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = 10.0.0.2/32, 192.168.4.0/24\n\
             Endpoint = 203.0.113.4:51821\n\
             PersistentKeepalive = 25\n",
            key_b64(),
            key_b64(),
        );

        let parsed = WireGuardConfig::parse(&config).unwrap();
        assert_eq!(parsed.interface.listen_port, Some(51820));
        assert_eq!(parsed.interface.mtu, Some(1380));
        assert_eq!(parsed.interface.address.len(), 1);
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].allowed_ips.len(), 2);
        assert_eq!(parsed.peers[0].persistent_keepalive, Some(25));
    }

    #[test]
    fn rejects_missing_private_key() {
        let config = "[Interface]\nListenPort = 51820\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn rejects_bad_base64() {
        let config = "[Interface]\nPrivateKey = not-base64!\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::InvalidKey { .. })
        ));
    }

    #[test]
    fn rejects_keys_outside_sections() {
        let config = "PrivateKey = whatever\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let config = format!(
            "# leading comment\n\n[Interface]\nPrivateKey = {} # trailing\n",
            key_b64()
        );
        assert!(WireGuardConfig::parse(&config).is_ok());
    }
}
