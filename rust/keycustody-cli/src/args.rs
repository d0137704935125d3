use crate::error::Result;
use clap::{Parser, Subcommand};
use keycustody::Config;
use securepool::SecureMode;
use std::path::PathBuf;

/// Encrypt and decrypt files under keys held in locked memory
#[derive(Parser, Debug)]
#[command(name = "keycustody", author, version, about, long_about = None)]
pub struct Cli {
    /// Where key buffers live: disabled, preferred, or required
    #[arg(long, global = true)]
    pub secure_mode: Option<SecureMode>,

    /// Upper bound for locked memory in bytes
    #[arg(long = "secure-memory", global = true)]
    pub secure_memory: Option<usize>,

    /// Key size in bytes (16 or 32)
    #[arg(long, global = true)]
    pub key_size: Option<usize>,

    /// Plaintext bytes per encrypted chunk
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// JSON config file; flags given on the command line override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a new random key and write it to a file
    Genkey {
        /// Destination key file
        #[arg(long)]
        out: PathBuf,
        /// Replace the key file if it already exists
        #[arg(long)]
        force: bool,
    },

    /// Encrypt a file
    Encrypt {
        /// Key file
        #[arg(long)]
        key: PathBuf,
        /// Plaintext input
        #[arg(long)]
        input: PathBuf,
        /// Encrypted output
        #[arg(long)]
        output: PathBuf,
    },

    /// Decrypt a file produced by `encrypt`
    Decrypt {
        /// Key file
        #[arg(long)]
        key: PathBuf,
        /// Encrypted input
        #[arg(long)]
        input: PathBuf,
        /// Plaintext output
        #[arg(long)]
        output: PathBuf,
    },
}

impl Cli {
    /// Builds the lifecycle config: the `--config` file (or defaults) with the
    /// command-line flags applied on top.
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::new(),
        };

        if let Some(mode) = self.secure_mode {
            config = config.with_secure_mode(mode);
        }
        if let Some(bytes) = self.secure_memory {
            config = config.with_secure_memory_budget(bytes);
        }
        if let Some(bytes) = self.key_size {
            config = config.with_key_size(bytes);
        }
        if let Some(bytes) = self.chunk_size {
            config = config.with_chunk_size(bytes);
        }
        if self.debug {
            config = config.with_debug(true);
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_parse() {
        let cli = Cli::try_parse_from([
            "keycustody",
            "--secure-mode",
            "disabled",
            "--key-size",
            "16",
            "genkey",
            "--out",
            "k.bin",
        ])
        .unwrap();
        assert_eq!(cli.secure_mode, Some(SecureMode::Disabled));
        assert!(matches!(cli.command, Command::Genkey { force: false, .. }));

        let config = cli.to_config().unwrap();
        assert_eq!(config.key_size, 16);
        assert_eq!(config.secure_mode, SecureMode::Disabled);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "keycustody",
            "encrypt",
            "--key",
            "k",
            "--input",
            "i",
            "--output",
            "o",
            "--chunk-size",
            "4096",
            "--debug",
        ])
        .unwrap();
        let config = cli.to_config().unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert!(config.debug);
    }

    #[test]
    fn test_genkey_force_flag() {
        let cli = Cli::try_parse_from(["keycustody", "genkey", "--out", "k", "--force"]).unwrap();
        assert!(matches!(cli.command, Command::Genkey { force: true, .. }));
    }

    #[test]
    fn test_unknown_secure_mode_rejected() {
        let parsed = Cli::try_parse_from(["keycustody", "--secure-mode", "sometimes", "genkey", "--out", "k"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"secure_mode": "required", "key_size": 16, "chunk_size": 512}}"#).unwrap();

        let path = file.path().to_str().unwrap();
        let cli = Cli::try_parse_from([
            "keycustody", "--config", path, "--key-size", "32", "genkey", "--out", "k",
        ])
        .unwrap();
        let config = cli.to_config().unwrap();
        assert_eq!(config.secure_mode, SecureMode::Required);
        assert_eq!(config.key_size, 32);
        assert_eq!(config.chunk_size, 512);
    }

    #[test]
    fn test_invalid_key_size_is_config_error() {
        let cli = Cli::try_parse_from(["keycustody", "--key-size", "24", "genkey", "--out", "k"]).unwrap();
        let err = cli.to_config().unwrap_err();
        assert_eq!(err.exit_code(), 16);
    }
}
