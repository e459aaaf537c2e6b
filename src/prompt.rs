use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use std::io::{self, BufRead, IsTerminal, Write};
use tracing::debug;

use crate::config::{validate_passphrase, validate_ssid};
use crate::error::{HotspotError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    /// `None` for an open network.
    pub passphrase: Option<String>,
}

fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

fn optional(passphrase: String) -> Option<String> {
    (!passphrase.is_empty()).then_some(passphrase)
}

/// Non-interactive input: the SSID on the first line, the passphrase on the
/// second. A missing or empty second line means an open network.
pub fn read_piped<R: BufRead>(mut input: R) -> Result<Credentials> {
    let ssid = read_line(&mut input)?
        .ok_or_else(|| HotspotError::invalid("no SSID given on standard input"))?;
    validate_ssid(&ssid)?;

    let passphrase = read_line(&mut input)?.and_then(optional);
    if let Some(passphrase) = &passphrase {
        validate_passphrase(passphrase)?;
    }
    Ok(Credentials { ssid, passphrase })
}

/// Prompts until a valid SSID and a confirmed, valid passphrase are entered.
/// `echo` switches terminal echo while the passphrase is typed.
pub fn interactive<R: BufRead, W: Write>(
    mut input: R,
    mut output: W,
    echo: &mut dyn FnMut(bool),
) -> Result<Credentials> {
    let closed = || HotspotError::invalid("input closed before credentials were entered");

    let ssid = loop {
        write!(output, "SSID: ")?;
        output.flush()?;
        let ssid = read_line(&mut input)?.ok_or_else(closed)?;
        match validate_ssid(&ssid) {
            Ok(()) => break ssid,
            Err(e) => writeln!(output, "{}", e)?,
        }
    };

    let passphrase = loop {
        write!(output, "Passphrase (empty for an open network): ")?;
        output.flush()?;
        echo(false);
        let first = read_line(&mut input);
        writeln!(output)?;
        let first = match first {
            Ok(line) => line,
            Err(e) => {
                echo(true);
                return Err(e);
            }
        };
        let Some(first) = first else {
            echo(true);
            return Err(closed());
        };

        if first.is_empty() {
            echo(true);
            break None;
        }
        if let Err(e) = validate_passphrase(&first) {
            echo(true);
            writeln!(output, "{}", e)?;
            continue;
        }

        write!(output, "Retype passphrase: ")?;
        output.flush()?;
        let second = read_line(&mut input);
        echo(true);
        writeln!(output)?;
        let second = second?.ok_or_else(closed)?;

        if first == second {
            break Some(first);
        }
        writeln!(output, "Passphrases do not match")?;
    };

    Ok(Credentials { ssid, passphrase })
}

/// Reads credentials from the terminal, or from piped standard input.
pub fn read_credentials() -> Result<Credentials> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        debug!("reading credentials from standard input");
        return read_piped(stdin.lock());
    }

    let original = tcgetattr(&stdin).ok();
    let mut echo = |on: bool| {
        let Some(original) = &original else {
            return;
        };
        let mut termios = original.clone();
        if !on {
            termios.local_flags.remove(LocalFlags::ECHO);
        }
        if let Err(e) = tcsetattr(&stdin, SetArg::TCSANOW, &termios) {
            debug!("could not switch terminal echo: {}", e);
        }
    };
    interactive(stdin.lock(), io::stderr(), &mut echo)
}
