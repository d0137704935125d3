use crate::args::{Cli, Command};
use crate::error::{CliError, Result};
use crate::keyfile::KeyFile;
use keycustody::{Config, KeyHandle, KeyLifecycle};
use log::{info, warn};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Runs one command against a fresh lifecycle.
///
/// The lifecycle is shut down on every path once it has been initialized, so
/// keys are wiped even when the command fails. The command's error wins over
/// a shutdown error.
pub fn run(cli: &Cli, config: Config) -> Result<()> {
    let lifecycle = KeyLifecycle::new(config)?;
    lifecycle.initialize()?;
    info!(
        "Key buffers in {} memory",
        if lifecycle.secure_memory_active() { "locked" } else { "heap" }
    );

    let outcome = execute(&lifecycle, &cli.command);
    let shutdown = lifecycle.shutdown();
    outcome?;
    shutdown?;
    Ok(())
}

fn execute(lifecycle: &KeyLifecycle, command: &Command) -> Result<()> {
    match command {
        Command::Genkey { out, force } => {
            let key = lifecycle.generate()?;
            let file = KeyFile::new(out);
            lifecycle.with_key_bytes(&key, |bytes| file.write(bytes, *force))??;
            info!("Generated {} and wrote it to {}", key.id(), out.display());
        }
        Command::Encrypt { key, input, output } => {
            let handle = load_key(lifecycle, key)?;
            let consumed = stream_file(input, output, |r, w| {
                lifecycle.encrypt_stream(&handle, r, w).map_err(CliError::from)
            })?;
            info!("Encrypted {} bytes into {}", consumed, output.display());
        }
        Command::Decrypt { key, input, output } => {
            let handle = load_key(lifecycle, key)?;
            let written = stream_file(input, output, |r, w| {
                lifecycle.decrypt_stream(&handle, r, w).map_err(CliError::from)
            })?;
            info!("Decrypted {} bytes into {}", written, output.display());
        }
    }
    Ok(())
}

/// Loads a key file into the keyring. The file bytes are zeroized on return.
fn load_key(lifecycle: &KeyLifecycle, path: &Path) -> Result<KeyHandle> {
    let bytes = KeyFile::new(path).read(lifecycle.config().key_size)?;
    Ok(lifecycle.load(&bytes)?)
}

/// Whether `a` and `b` resolve to the same existing file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Runs `transform` from `input` into a newly created `output`. The output file
/// is removed if anything fails.
fn stream_file<F>(input: &Path, output: &Path, transform: F) -> Result<u64>
where
    F: FnOnce(&mut BufReader<File>, &mut BufWriter<File>) -> Result<u64>,
{
    let source = File::open(input).map_err(CliError::io("open input", input))?;
    if same_file(input, output) {
        return Err(CliError::SamePath(output.to_path_buf()));
    }
    let sink = File::create(output).map_err(CliError::io("create output", output))?;

    let mut reader = BufReader::new(source);
    let mut writer = BufWriter::new(sink);
    let result = transform(&mut reader, &mut writer).and_then(|n| {
        writer
            .flush()
            .and_then(|()| writer.get_ref().sync_all())
            .map(|()| n)
            .map_err(CliError::io("write output", output))
    });

    if result.is_err() {
        drop(writer);
        discard_partial(output);
    }
    result
}

fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Could not remove partial output {}: {}", path.display(), e);
    }
}
