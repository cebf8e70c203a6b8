use anyhow::{Context, Result};
use std::path::Path;

use crate::tls::CertificateProvider;

/// Generate self-signed TLS certificate
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let provider = CertificateProvider::new(common_name, alt_names.to_vec());
    let certificate = provider
        .generate()
        .context("Failed to generate self-signed certificate")?;

    certificate
        .write_pem_files(Path::new(cert_out), Path::new(key_out))
        .with_context(|| format!("Failed to write certificate to {} / {}", cert_out, key_out))?;

    println!("Generated self-signed certificate: {}", cert_out);
    println!("Generated private key: {}", key_out);
    println!("Subject alt names: {}", provider.subject_alt_names().join(", "));

    Ok(())
}
