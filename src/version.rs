use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::str::FromStr;

/// A PEP 440 package version.
///
/// Covers the grammar actually seen on PyPI: epoch, release segments,
/// alpha/beta/rc pre-releases, post-releases, dev-releases and local version
/// labels. Comparison implements the PEP 440 total order, which is what the
/// time-travel resolver and the downgrade detector rely on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub(crate) epoch: u64,
    pub(crate) release: Vec<u64>,
    pub(crate) pre: Option<(PreReleaseKind, u64)>,
    pub(crate) post: Option<u64>,
    pub(crate) dev: Option<u64>,
    pub(crate) local: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PreReleaseKind {
    Alpha,
    Beta,
    ReleaseCandidate,
}

impl Version {
    /// Release segments with trailing zeros removed, so that `1.0` and
    /// `1.0.0` compare equal as PEP 440 requires.
    fn trimmed_release(&self) -> &[u64] {
        let mut len = self.release.len();
        while len > 1 && self.release[len - 1] == 0 {
            len -= 1;
        }
        &self.release[..len]
    }

    /// The pre-release comparison key. A version that is only a dev-release
    /// sorts before any pre-release of the same release segment, while a
    /// final release sorts after all of them.
    fn pre_key(&self) -> PreKey {
        match (self.pre, self.post, self.dev) {
            (Some((kind, number)), _, _) => PreKey::Value(kind, number),
            (None, None, Some(_)) => PreKey::NegativeInfinity,
            (None, _, _) => PreKey::Infinity,
        }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum PreKey {
    NegativeInfinity,
    Value(PreReleaseKind, u64),
    Infinity,
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.trimmed_release().cmp(other.trimmed_release()))
            .then_with(|| self.pre_key().cmp(&other.pre_key()))
            // Missing post-release sorts before any post-release.
            .then_with(|| {
                let key = |post: Option<u64>| post.map_or((0, 0), |number| (1, number));
                key(self.post).cmp(&key(other.post))
            })
            // Missing dev-release sorts after any dev-release.
            .then_with(|| {
                let key = |dev: Option<u64>| dev.map_or((1, 0), |number| (0, number));
                key(self.dev).cmp(&key(other.dev))
            })
            .then_with(|| local_key(self.local.as_deref()).cmp(&local_key(other.local.as_deref())))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Local version labels compare segment-wise, with numeric segments ordering
/// before (and among) themselves numerically and alphanumeric segments
/// ordering lexically. A version without a label sorts first.
fn local_key(local: Option<&str>) -> Vec<LocalSegment> {
    local
        .map(|label| {
            label
                .split(['.', '-', '_'])
                .map(|segment| match segment.parse::<u64>() {
                    Ok(number) => LocalSegment::Number(number),
                    Err(_) => LocalSegment::Text(segment.to_ascii_lowercase()),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum LocalSegment {
    Text(String),
    Number(u64),
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
        } = self;
        if *epoch != 0 {
            write!(f, "{epoch}!")?;
        }
        let release = release
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<String>>()
            .join(".");
        write!(f, "{release}")?;
        if let Some((kind, number)) = pre {
            let label = match kind {
                PreReleaseKind::Alpha => "a",
                PreReleaseKind::Beta => "b",
                PreReleaseKind::ReleaseCandidate => "rc",
            };
            write!(f, "{label}{number}")?;
        }
        if let Some(number) = post {
            write!(f, ".post{number}")?;
        }
        if let Some(number) = dev {
            write!(f, ".dev{number}")?;
        }
        if let Some(label) = local {
            write!(f, "+{label}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(version: &str) -> Result<Self, Self::Err> {
        parse_version(version)
    }
}

fn parse_version(input: &str) -> Result<Version, ParseVersionError> {
    let error = || ParseVersionError {
        version: input.to_string(),
    };

    let mut remaining = input.trim().to_ascii_lowercase();
    if let Some(stripped) = remaining.strip_prefix('v') {
        remaining = stripped.to_string();
    }
    if remaining.is_empty() {
        return Err(error());
    }

    let local = match remaining.split_once('+') {
        Some((prefix, label)) if !label.is_empty() => {
            let label = label.to_string();
            remaining = prefix.to_string();
            Some(label)
        }
        Some(_) => return Err(error()),
        None => None,
    };

    let epoch = match remaining.split_once('!') {
        Some((epoch, rest)) => {
            let epoch = epoch.parse().map_err(|_| error())?;
            remaining = rest.to_string();
            epoch
        }
        None => 0,
    };

    let mut parser = SegmentParser {
        characters: remaining.chars().collect(),
        position: 0,
    };

    let mut release = vec![parser.number().ok_or_else(error)?];
    while parser.eat('.') {
        match parser.number() {
            Some(segment) => release.push(segment),
            // A trailing `.dev0`-style segment; rewind over the dot.
            None => {
                parser.position -= 1;
                break;
            }
        }
    }

    let pre = parser.pre_release();
    let post = parser.labeled_number(&["post", "rev", "r"]);
    let dev = parser.labeled_number(&["dev"]);

    if !parser.at_end() {
        return Err(error());
    }

    Ok(Version {
        epoch,
        release,
        pre,
        post,
        dev,
        local,
    })
}

struct SegmentParser {
    characters: Vec<char>,
    position: usize,
}

impl SegmentParser {
    fn at_end(&self) -> bool {
        self.position >= self.characters.len()
    }

    fn eat(&mut self, wanted: char) -> bool {
        if self.characters.get(self.position) == Some(&wanted) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn eat_separator(&mut self) {
        if matches!(self.characters.get(self.position), Some('.' | '-' | '_')) {
            self.position += 1;
        }
    }

    fn number(&mut self) -> Option<u64> {
        let start = self.position;
        while matches!(self.characters.get(self.position), Some(c) if c.is_ascii_digit()) {
            self.position += 1;
        }
        if self.position == start {
            return None;
        }
        self.characters[start..self.position]
            .iter()
            .collect::<String>()
            .parse()
            .ok()
    }

    fn word(&mut self, label: &str) -> bool {
        let end = self.position + label.len();
        if end <= self.characters.len()
            && self.characters[self.position..end].iter().collect::<String>() == label
        {
            self.position = end;
            true
        } else {
            false
        }
    }

    fn pre_release(&mut self) -> Option<(PreReleaseKind, u64)> {
        let start = self.position;
        self.eat_separator();
        // Longest spellings first, so `rc` is not consumed as `c` etc.
        let spellings = [
            ("preview", PreReleaseKind::ReleaseCandidate),
            ("alpha", PreReleaseKind::Alpha),
            ("beta", PreReleaseKind::Beta),
            ("pre", PreReleaseKind::ReleaseCandidate),
            ("rc", PreReleaseKind::ReleaseCandidate),
            ("a", PreReleaseKind::Alpha),
            ("b", PreReleaseKind::Beta),
            ("c", PreReleaseKind::ReleaseCandidate),
        ];
        for (label, kind) in spellings {
            if self.word(label) {
                self.eat_separator();
                return Some((kind, self.number().unwrap_or(0)));
            }
        }
        self.position = start;
        None
    }

    fn labeled_number(&mut self, labels: &[&str]) -> Option<u64> {
        let start = self.position;
        self.eat_separator();
        for label in labels {
            if self.word(label) {
                self.eat_separator();
                return Some(self.number().unwrap_or(0));
            }
        }
        self.position = start;
        None
    }
}

/// The version string could not be parsed as a PEP 440 version.
#[derive(Debug)]
pub struct ParseVersionError {
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(input: &str) -> Version {
        input.parse().unwrap_or_else(|_| panic!("{input} should parse"))
    }

    #[test]
    fn parse_release_only() {
        assert_eq!(
            version("1.24.3"),
            Version {
                epoch: 0,
                release: vec![1, 24, 3],
                pre: None,
                post: None,
                dev: None,
                local: None,
            }
        );
    }

    #[test]
    fn parse_full_grammar() {
        assert_eq!(
            version("2!1.0rc2.post3.dev4+ubuntu.1"),
            Version {
                epoch: 2,
                release: vec![1, 0],
                pre: Some((PreReleaseKind::ReleaseCandidate, 2)),
                post: Some(3),
                dev: Some(4),
                local: Some("ubuntu.1".to_string()),
            }
        );
    }

    #[test]
    fn parse_alternate_spellings() {
        assert_eq!(version("1.0alpha1").pre, Some((PreReleaseKind::Alpha, 1)));
        assert_eq!(version("1.0-beta.2").pre, Some((PreReleaseKind::Beta, 2)));
        assert_eq!(
            version("1.0preview3").pre,
            Some((PreReleaseKind::ReleaseCandidate, 3))
        );
        assert_eq!(version("1.0c4").pre, Some((PreReleaseKind::ReleaseCandidate, 4)));
        assert_eq!(version("1.0-r5").post, Some(5));
        assert_eq!(version("v1.0").release, vec![1, 0]);
        assert_eq!(version("1.0.dev0").dev, Some(0));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("not.a.version".parse::<Version>().is_err());
        assert!("1.0.snapshot".parse::<Version>().is_err());
        assert!("1.0+".parse::<Version>().is_err());
    }

    #[test]
    fn ordering_matches_pep_440() {
        let ordered = [
            "0.9",
            "1.0.dev1",
            "1.0a1",
            "1.0a2.dev1",
            "1.0a2",
            "1.0b1",
            "1.0rc1",
            "1.0",
            "1.0+local",
            "1.0.post1",
            "1.1.dev1",
            "1.1",
            "2!0.1",
        ];
        for window in ordered.windows(2) {
            assert!(
                version(window[0]) < version(window[1]),
                "{} should sort before {}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn trailing_zeros_are_insignificant() {
        assert_eq!(version("1.0").cmp(&version("1.0.0")), Ordering::Equal);
        assert!(version("1.0.1") > version("1.0"));
    }

    #[test]
    fn local_labels_compare_segment_wise() {
        assert!(version("1.0+abc") < version("1.0+abc.1"));
        assert!(version("1.0+2") < version("1.0+10"));
        // Numeric local segments sort above alphanumeric ones.
        assert!(version("1.0+abc") < version("1.0+2"));
    }

    #[test]
    fn display_round_trips() {
        for input in ["1.24.3", "2!1.0rc2.post3.dev4+ubuntu.1", "1.0a0", "0.1.dev5"] {
            assert_eq!(version(input).to_string(), input);
        }
    }
}
