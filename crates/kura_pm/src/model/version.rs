use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Version string split into numeric components and an optional qualifier.
///
/// `1.2.3` is read as `[1, 2, 3]` with no qualifier, `2.0-beta-1` as `[2, 0]`
/// with qualifier `beta-1` and `1.0.RC1` as `[1, 0]` with qualifier `RC1`.
/// Any version with a qualifier orders below the same numbers without one.
#[derive(Debug, Clone)]
pub struct ArtifactVersion {
    raw: String,
    numbers: Vec<u64>,
    qualifier: Option<String>,
}

impl ArtifactVersion {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let (head, tail) = match trimmed.split_once('-') {
            Some((head, tail)) => (head, Some(tail)),
            None => (trimmed, None),
        };

        let mut numbers = Vec::new();
        let mut leftover: Vec<&str> = Vec::new();
        for component in head.split('.') {
            if leftover.is_empty() {
                if let Ok(value) = component.parse::<u64>() {
                    numbers.push(value);
                    continue;
                }
            }
            leftover.push(component);
        }

        let mut qualifier = leftover.join(".");
        if let Some(tail) = tail {
            if !qualifier.is_empty() {
                qualifier.push('-');
            }
            qualifier.push_str(tail);
        }

        Self {
            raw: trimmed.to_string(),
            numbers,
            qualifier: (!qualifier.is_empty()).then_some(qualifier),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn numbers(&self) -> &[u64] {
        &self.numbers
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    /// Releases carry no qualifier at all.
    pub fn is_release(&self) -> bool {
        self.qualifier.is_none() && !self.numbers.is_empty()
    }

    fn compare_numbers(&self, other: &Self) -> Ordering {
        let len = self.numbers.len().max(other.numbers.len());
        for index in 0..len {
            let left = self.numbers.get(index).copied().unwrap_or(0);
            let right = other.numbers.get(index).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }

    fn compare_qualifiers(&self, other: &Self) -> Ordering {
        match (&self.qualifier, &other.qualifier) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(left), Some(right)) => left.to_ascii_lowercase().cmp(&right.to_ascii_lowercase()),
        }
    }
}

impl Ord for ArtifactVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_numbers(other)
            .then_with(|| self.compare_qualifiers(other))
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for ArtifactVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ArtifactVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ArtifactVersion {}

impl fmt::Display for ArtifactVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ArtifactVersion {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(value))
    }
}

/// Sorts version strings ascending and drops duplicates.
pub fn sort_versions(versions: &mut Vec<String>) {
    versions.sort_by(|left, right| ArtifactVersion::parse(left).cmp(&ArtifactVersion::parse(right)));
    versions.dedup();
}
