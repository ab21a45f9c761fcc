//! Resolver configuration.
//!
//! [`Config`] collects everything the resolver needs to know: which
//! nameservers to query, the search suffixes for relative names and the
//! knobs that govern retry behavior. A configuration can be assembled in
//! code or parsed from a glibc-style `resolv.conf` file via [`Config::parse`]
//! and friends. Parsing is modeled along the lines of glibc's resolver,
//! with the caps glibc applies: `timeout` at 30 seconds, `attempts` at 5
//! and `ndots` at 15.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::str::SplitWhitespace;
use std::time::Duration;

use thiserror::Error;

use crate::ip::Ip;

/// The default and maximum values of the tunable options.
const DEF_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(30);
const DEF_ATTEMPTS: usize = 2;
const MAX_ATTEMPTS: usize = 5;
const DEF_NDOTS: usize = 1;
const MAX_NDOTS: usize = 15;

/// The default EDNS payload size advertised in queries.
const DEF_PAYLOAD_SIZE: u16 = 4096;

/// The default number of UDP sockets kept in the pool.
const DEF_SOCKETS: usize = 1;

/// The default number of user callbacks per delivery tick.
const DEF_BUDGET: usize = 64;

//------------ Nameserver ----------------------------------------------------

/// One upstream nameserver endpoint.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Nameserver {
    /// The server's address.
    pub ip: Ip,

    /// The server's port, 53 unless told otherwise.
    pub port: u16,
}

impl Nameserver {
    /// Creates an endpoint on the standard DNS port.
    pub fn new(ip: Ip) -> Self {
        Nameserver { ip, port: 53 }
    }

    /// Creates an endpoint on a specific port.
    pub fn with_port(ip: Ip, port: u16) -> Self {
        Nameserver { ip, port }
    }
}

//------------ Mode ----------------------------------------------------------

/// How to treat unrecognized configuration lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Ignore anything unrecognized.
    Lenient,

    /// Fail on unrecognized lines. Unknown words inside an `options` line
    /// are still ignored, as glibc does.
    Strict,
}

//------------ Config --------------------------------------------------------

/// Resolver configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The nameservers to query, in order.
    pub nameservers: Vec<Nameserver>,

    /// Suffixes appended to relative names, in order.
    pub search: Vec<String>,

    /// Minimum number of dots in a name before it is tried bare first.
    pub ndots: usize,

    /// Time to wait for a response to a single attempt.
    pub timeout: Duration,

    /// Number of passes over the nameserver list per candidate name.
    pub attempts: usize,

    /// Spread load by rotating the starting nameserver per operation.
    pub rotate: bool,

    /// UDP payload size advertised through EDNS. Advertising exactly 512
    /// disables the EDNS pseudo-record unless DNSSEC data is requested.
    pub payload_size: u16,

    /// Number of UDP socket slots in the pool.
    pub sockets: usize,

    /// Maximum number of user callbacks invoked per delivery tick.
    pub budget: usize,
}

impl Config {
    /// Creates a configuration with no nameservers and default options.
    pub fn new() -> Self {
        Config {
            nameservers: Vec::new(),
            search: Vec::new(),
            ndots: DEF_NDOTS,
            timeout: DEF_TIMEOUT,
            attempts: DEF_ATTEMPTS,
            rotate: false,
            payload_size: DEF_PAYLOAD_SIZE,
            sockets: DEF_SOCKETS,
            budget: DEF_BUDGET,
        }
    }

    /// Creates the system configuration from `/etc/resolv.conf`.
    ///
    /// Parsing happens leniently; a missing or unreadable file yields the
    /// finalized default configuration.
    pub fn system() -> Self {
        let mut conf = Config::new();
        let _ = conf.parse_file("/etc/resolv.conf", Mode::Lenient);
        conf.finalize();
        conf
    }

    /// Makes the configuration usable.
    ///
    /// Supplies `127.0.0.1` when no nameserver was configured, clamps the
    /// tunables to their caps and makes sure the pool has at least one
    /// socket and the message buffers fit a legacy message.
    pub fn finalize(&mut self) {
        if self.nameservers.is_empty() {
            self.nameservers.push(Nameserver::new(Ip::loopback(4)));
        }
        self.timeout = self.timeout.min(MAX_TIMEOUT);
        self.attempts = self.attempts.clamp(1, MAX_ATTEMPTS);
        self.ndots = self.ndots.min(MAX_NDOTS);
        self.sockets = self.sockets.max(1);
        self.payload_size = self.payload_size.max(512);
        self.budget = self.budget.max(1);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// # Parsing Configuration Files
///
impl Config {
    /// Parses configuration from a file.
    pub fn parse_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        mode: Mode,
    ) -> Result<(), ConfError> {
        let mut file = fs::File::open(path)?;
        self.parse(&mut file, mode)
    }

    /// Parses configuration from a reader in `resolv.conf` format.
    pub fn parse<R: Read>(
        &mut self,
        reader: &mut R,
        mode: Mode,
    ) -> Result<(), ConfError> {
        use std::io::BufRead;

        for line in io::BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty()
                || line.starts_with(';')
                || line.starts_with('#')
            {
                continue;
            }

            let mut words = line.split_whitespace();
            let res = match words.next() {
                Some("nameserver") => self.parse_nameserver(words),
                Some("domain") => self.parse_domain(words),
                Some("search") => self.parse_search(words),
                Some("options") => self.parse_options(words),
                _ => Err(ConfError::UnknownLine(line.into())),
            };
            match res {
                Ok(()) => {}
                Err(err) if mode == Mode::Strict => return Err(err),
                Err(_) => continue,
            }
        }
        Ok(())
    }

    fn parse_nameserver(
        &mut self,
        mut words: SplitWhitespace,
    ) -> Result<(), ConfError> {
        let word = next_word(&mut words)?;
        let ip = word
            .parse::<Ip>()
            .map_err(|_| ConfError::UnknownLine(word.into()))?;
        self.nameservers.push(Nameserver::new(ip));
        no_more_words(words)
    }

    fn parse_domain(
        &mut self,
        mut words: SplitWhitespace,
    ) -> Result<(), ConfError> {
        // A domain line is a single-entry search list; like `search` it
        // replaces whatever came before.
        let domain = next_word(&mut words)?;
        self.search = vec![domain.into()];
        no_more_words(words)
    }

    fn parse_search(
        &mut self,
        words: SplitWhitespace,
    ) -> Result<(), ConfError> {
        // The latest search line wins, replacing prior entries.
        self.search = words.map(Into::into).collect();
        Ok(())
    }

    fn parse_options(
        &mut self,
        words: SplitWhitespace,
    ) -> Result<(), ConfError> {
        for word in words {
            match split_arg(word)? {
                ("rotate", None) => self.rotate = true,
                ("timeout", Some(n)) => {
                    self.timeout =
                        Duration::from_secs(n as u64).min(MAX_TIMEOUT)
                }
                ("attempts", Some(n)) => {
                    self.attempts = n.min(MAX_ATTEMPTS)
                }
                ("ndots", Some(n)) => self.ndots = n.min(MAX_NDOTS),
                // Unknown or misformatted options are ignored.
                _ => {}
            }
        }
        Ok(())
    }
}

//------------ Private Helpers -----------------------------------------------

/// Returns the next word or an error.
fn next_word<'a>(
    words: &'a mut SplitWhitespace,
) -> Result<&'a str, ConfError> {
    words.next().ok_or(ConfError::MissingValue)
}

/// Errors out if there are words left.
fn no_more_words(mut words: SplitWhitespace) -> Result<(), ConfError> {
    match words.next() {
        Some(word) => Err(ConfError::UnknownLine(word.into())),
        None => Ok(()),
    }
}

/// Splits an `option` or `option:value` word.
fn split_arg(s: &str) -> Result<(&str, Option<usize>), ConfError> {
    match s.find(':') {
        Some(idx) => {
            let (left, right) = s.split_at(idx);
            let value = right[1..]
                .parse()
                .map_err(|_| ConfError::MissingValue)?;
            Ok((left, Some(value)))
        }
        None => Ok((s, None)),
    }
}

//------------ ConfError -----------------------------------------------------

/// An error while parsing a configuration file.
#[derive(Debug, Error)]
pub enum ConfError {
    /// A line was not recognized (strict mode only surfaces this).
    #[error("unrecognized: {0}")]
    UnknownLine(String),

    /// An option required a value that was missing or malformed.
    #[error("missing or malformed value")]
    MissingValue,

    /// Reading the file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

//============ Testing ======================================================
