use std::sync::LazyLock;

use regex::Regex;

pub const CANDIDATE_PREFIX: &str = "a=candidate";
pub const END_OF_CANDIDATES: &str = "a=end-of-candidates";
const HOST_SUFFIX: &str = "host";
const LINE_SEPARATOR: &str = "\r\n";

/// Host candidates forwarded to the peer connection. The controller only
/// answers on its local interfaces, so the first two are all that matter.
pub const MAX_HOST_CANDIDATES: usize = 2;

static IPV4_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("IPv4 pattern is valid")
});

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SdpError {
    #[error("answer has no '{CANDIDATE_PREFIX}' line")]
    MissingCandidates,
    #[error("answer has no '{END_OF_CANDIDATES}' line")]
    MissingEndOfCandidates,
    #[error("'{END_OF_CANDIDATES}' (line {end}) precedes the first candidate (line {start})")]
    MisorderedCandidates { start: usize, end: usize },
}

/// Rewrite the controller's SDP answer so the client connects to the
/// publicly reachable `hostname` instead of the controller's internal address.
///
/// Lines before the candidate block and from `a=end-of-candidates` on are
/// copied untouched. Inside the block only the first two host candidates
/// survive, with their IPv4 literal replaced by `hostname`.
pub fn rewrite_answer(sdp: &str, hostname: &str) -> Result<String, SdpError> {
    let lines: Vec<&str> = sdp.split(LINE_SEPARATOR).collect();

    let start = lines
        .iter()
        .position(|l| l.starts_with(CANDIDATE_PREFIX))
        .ok_or(SdpError::MissingCandidates)?;
    let end = lines
        .iter()
        .position(|l| *l == END_OF_CANDIDATES)
        .ok_or(SdpError::MissingEndOfCandidates)?;
    if end < start {
        return Err(SdpError::MisorderedCandidates { start, end });
    }

    let candidates = lines[start..end]
        .iter()
        .filter(|l| l.ends_with(HOST_SUFFIX))
        .take(MAX_HOST_CANDIDATES)
        .map(|l| IPV4_LITERAL.replace_all(l, hostname).into_owned());

    let rewritten: Vec<String> = lines[..start]
        .iter()
        .map(|l| l.to_string())
        .chain(candidates)
        .chain(lines[end..].iter().map(|l| l.to_string()))
        .collect();

    Ok(rewritten.join(LINE_SEPARATOR))
}
