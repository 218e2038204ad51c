//! PuTTY registry store
//!
//! Sessions live under `HKCU\Software\SimonTatham\PuTTY\Sessions\<alias>`
//! and trusted host keys under `...\PuTTY\SshHostKeys` as
//! `rsa2@<port>:127.0.0.1 = 0x<exponent>,0x<modulus>`. The registry is
//! driven through `reg.exe`.

use crate::store::{HostEntry, KeyFormat, SshClientConfigStore};
use crate::SshError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::process::Command;
use tracing::debug;

const SESSIONS_KEY: &str = r"HKCU\Software\SimonTatham\PuTTY\Sessions";
const HOST_KEYS_KEY: &str = r"HKCU\Software\SimonTatham\PuTTY\SshHostKeys";

/// Runs `reg.exe` with the given arguments
pub trait RegistryRunner: Send + Sync {
    fn run(&self, args: &[String]) -> Result<(), SshError>;
}

pub struct RegExe;

impl RegistryRunner for RegExe {
    fn run(&self, args: &[String]) -> Result<(), SshError> {
        let output = Command::new("reg").args(args).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SshError::Registry(format!(
                "reg {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

pub struct PuttyConfigStore<R: RegistryRunner = RegExe> {
    runner: R,
}

impl PuttyConfigStore<RegExe> {
    pub fn new() -> Self {
        Self { runner: RegExe }
    }
}

impl Default for PuttyConfigStore<RegExe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RegistryRunner> PuttyConfigStore<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    fn set_value(&self, key: &str, name: &str, kind: &str, data: &str) -> Result<(), SshError> {
        self.runner.run(&[
            "add".to_string(),
            key.to_string(),
            "/v".to_string(),
            name.to_string(),
            "/t".to_string(),
            kind.to_string(),
            "/d".to_string(),
            data.to_string(),
            "/f".to_string(),
        ])
    }
}

impl<R: RegistryRunner> SshClientConfigStore for PuttyConfigStore<R> {
    fn name(&self) -> &'static str {
        "putty"
    }

    fn key_format(&self) -> KeyFormat {
        KeyFormat::Putty
    }

    fn add_host(&self, entry: &HostEntry) -> Result<(), SshError> {
        let key = format!(r"{}\{}", SESSIONS_KEY, entry.alias);
        self.set_value(&key, "HostName", "REG_SZ", &entry.hostname)?;
        self.set_value(&key, "PortNumber", "REG_DWORD", &entry.port.to_string())?;
        self.set_value(&key, "UserName", "REG_SZ", &entry.user)?;
        self.set_value(&key, "Protocol", "REG_SZ", "ssh")?;
        self.set_value(
            &key,
            "PublicKeyFile",
            "REG_SZ",
            &entry.identity_file.display().to_string(),
        )?;
        debug!("Added PuTTY session {}", entry.alias);
        Ok(())
    }

    fn remove_host(&self, alias: &str) -> Result<(), SshError> {
        self.runner.run(&[
            "delete".to_string(),
            format!(r"{}\{}", SESSIONS_KEY, alias),
            "/f".to_string(),
        ])
    }

    fn add_host_key(&self, _alias: &str, port: u16, public_key: &str) -> Result<(), SshError> {
        let (exponent, modulus) = rsa_components(public_key)?;
        self.set_value(
            HOST_KEYS_KEY,
            &host_key_name(port),
            "REG_SZ",
            &format!("{},{}", exponent, modulus),
        )
    }

    fn remove_host_key(&self, _alias: &str, port: u16) -> Result<(), SshError> {
        self.runner.run(&[
            "delete".to_string(),
            HOST_KEYS_KEY.to_string(),
            "/v".to_string(),
            host_key_name(port),
            "/f".to_string(),
        ])
    }
}

fn host_key_name(port: u16) -> String {
    format!("rsa2@{}:127.0.0.1", port)
}

/// Exponent and modulus of an `ssh-rsa` public key line, as PuTTY hex
pub fn rsa_components(public_key: &str) -> Result<(String, String), SshError> {
    let mut fields = public_key.split_whitespace();
    let (Some("ssh-rsa"), Some(encoded)) = (fields.next(), fields.next()) else {
        return Err(SshError::InvalidHostKey(
            "expected an ssh-rsa public key".to_string(),
        ));
    };
    let blob = STANDARD
        .decode(encoded)
        .map_err(|e| SshError::InvalidHostKey(e.to_string()))?;

    let mut cursor = blob.as_slice();
    let kind = read_field(&mut cursor)?;
    if kind != b"ssh-rsa" {
        return Err(SshError::InvalidHostKey(format!(
            "unexpected key type {}",
            String::from_utf8_lossy(kind)
        )));
    }
    let exponent = read_field(&mut cursor)?;
    let modulus = read_field(&mut cursor)?;
    Ok((to_hex(exponent), to_hex(modulus)))
}

fn read_field<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], SshError> {
    let truncated = || SshError::InvalidHostKey("truncated key blob".to_string());
    if cursor.len() < 4 {
        return Err(truncated());
    }
    let (len, rest) = cursor.split_at(4);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return Err(truncated());
    }
    let (field, rest) = rest.split_at(len);
    *cursor = rest;
    Ok(field)
}

fn to_hex(bytes: &[u8]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let trimmed = hex.trim_start_matches('0');
    format!("0x{}", if trimmed.is_empty() { "0" } else { trimmed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<String>>>);

    impl RegistryRunner for &Recorder {
        fn run(&self, args: &[String]) -> Result<(), SshError> {
            self.0.lock().unwrap().push(args.to_vec());
            Ok(())
        }
    }

    fn encode_field(out: &mut Vec<u8>, field: &[u8]) {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }

    fn rsa_line(exponent: &[u8], modulus: &[u8]) -> String {
        let mut blob = Vec::new();
        encode_field(&mut blob, b"ssh-rsa");
        encode_field(&mut blob, exponent);
        encode_field(&mut blob, modulus);
        format!("ssh-rsa {} root@host", STANDARD.encode(blob))
    }

    #[test]
    fn test_rsa_components() {
        let line = rsa_line(&[0x01, 0x00, 0x01], &[0x00, 0xc3, 0x5a, 0x07]);
        let (e, n) = rsa_components(&line).unwrap();
        assert_eq!(e, "0x10001");
        assert_eq!(n, "0xc35a07");
    }

    #[test]
    fn test_rsa_components_rejects_other_keys() {
        assert!(rsa_components("ssh-ed25519 AAAAC3Nz").is_err());
        assert!(rsa_components("ssh-rsa !!!").is_err());
        assert!(rsa_components(&format!("ssh-rsa {}", STANDARD.encode([0, 0, 0, 9]))).is_err());
    }

    #[test]
    fn test_session_and_host_key_commands() {
        let recorder = Recorder::default();
        let store = PuttyConfigStore::with_runner(&recorder);

        store
            .add_host(&HostEntry {
                alias: "pipe-12345".to_string(),
                hostname: "127.0.0.1".to_string(),
                port: 4567,
                user: "root".to_string(),
                identity_file: PathBuf::from(r"C:\Users\alice\.pipetun\ssh\key.ppk"),
            })
            .unwrap();
        store
            .add_host_key("pipe-12345", 4567, &rsa_line(&[0x03], &[0x0f, 0xff]))
            .unwrap();
        store.remove_host_key("pipe-12345", 4567).unwrap();
        store.remove_host("pipe-12345").unwrap();

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 8);
        assert_eq!(
            calls[0][1],
            r"HKCU\Software\SimonTatham\PuTTY\Sessions\pipe-12345"
        );
        assert_eq!(calls[1][3], "PortNumber");
        assert_eq!(calls[1][7], "4567");
        assert_eq!(calls[5][3], "rsa2@4567:127.0.0.1");
        assert_eq!(calls[5][7], "0x3,0xfff");
        assert_eq!(calls[6][0], "delete");
        assert_eq!(calls[7][1], r"HKCU\Software\SimonTatham\PuTTY\Sessions\pipe-12345");
    }
}
