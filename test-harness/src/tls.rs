// Self-signed TLS material for listener tests.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Write a self-signed certificate and key under `dir`, returning
/// `(cert_path, key_path)`.
pub fn write_self_signed(dir: &Path, host: &str) -> Result<(PathBuf, PathBuf)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![host.to_string()])
            .context("generate self-signed certificate")?;
    let cert_path = dir.join("proxy-cert.pem");
    let key_path = dir.join("proxy-key.pem");
    std::fs::write(&cert_path, cert.pem()).context("write certificate")?;
    std::fs::write(&key_path, key_pair.serialize_pem()).context("write key")?;
    Ok((cert_path, key_path))
}
