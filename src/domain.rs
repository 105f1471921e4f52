use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

pub const REMOTE_GENOME_METADATA: &str = "RELEASE_NOTES/genome_metadata";
pub const REMOTE_AMR_PHENOTYPES: &str = "RELEASE_NOTES/PATRIC_genomes_AMR.txt";

fn genome_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+$").expect("genome id pattern"))
}

/// BV-BRC genome identifier, `<taxon>.<serial>` (e.g. `562.7587`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenomeId(String);

impl GenomeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenomeId {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !genome_id_pattern().is_match(normalized) {
            return Err(FetchError::InvalidGenomeId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Contigs,
    Features,
}

impl ArtifactKind {
    /// Per-item processing order.
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Contigs, ArtifactKind::Features];

    pub fn root_dir(self) -> &'static str {
        match self {
            ArtifactKind::Contigs => "contigs",
            ArtifactKind::Features => "features",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Contigs => "fna",
            ArtifactKind::Features => "PATRIC.features.tab",
        }
    }

    pub fn file_name(self, id: &GenomeId) -> String {
        format!("{id}.{}", self.extension())
    }

    pub fn remote_path(self, id: &GenomeId) -> String {
        format!("genomes/{id}/{}", self.file_name(id))
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root_dir())
    }
}

impl FromStr for ArtifactKind {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contigs" | "fna" => Ok(ArtifactKind::Contigs),
            "features" | "tab" => Ok(ArtifactKind::Features),
            _ => Err(FetchError::InvalidArtifactKind(value.to_string())),
        }
    }
}

/// Set of artifact kinds requested for a batch, iterated in [`ArtifactKind::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ArtifactSelection {
    pub contigs: bool,
    pub features: bool,
}

impl ArtifactSelection {
    pub fn all() -> Self {
        Self {
            contigs: true,
            features: true,
        }
    }

    pub fn from_kinds(kinds: &[ArtifactKind]) -> Self {
        let mut selection = Self::default();
        for kind in kinds {
            match kind {
                ArtifactKind::Contigs => selection.contigs = true,
                ArtifactKind::Features => selection.features = true,
            }
        }
        selection
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Contigs => self.contigs,
            ArtifactKind::Features => self.features,
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = ArtifactKind> + '_ {
        ArtifactKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
    }

    pub fn len(&self) -> usize {
        self.kinds().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One genome in a batch download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub id: GenomeId,
    pub name: String,
}

impl BatchItem {
    pub fn new(id: GenomeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Single-id downloads use the id as the display name, like bulk rows without a name.
    pub fn from_id(id: GenomeId) -> Self {
        let name = id.as_str().to_string();
        Self { id, name }
    }

    pub fn directory_name(&self) -> String {
        sanitize_name(&self.name)
    }
}

pub fn sanitize_name(name: &str) -> String {
    let trimmed = name.trim();
    let replaced: String = trimmed
        .chars()
        .map(|ch| match ch {
            ' ' => '-',
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    if replaced.is_empty() || replaced == "." || replaced == ".." {
        "_".to_string()
    } else {
        replaced
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_genome_id_valid() {
        let id: GenomeId = " 562.7587 ".parse().unwrap();
        assert_eq!(id.as_str(), "562.7587");
    }

    #[test]
    fn parse_genome_id_invalid() {
        let err = "562".parse::<GenomeId>().unwrap_err();
        assert_matches!(err, FetchError::InvalidGenomeId(_));
        assert!("abc.1".parse::<GenomeId>().is_err());
    }

    #[test]
    fn remote_paths() {
        let id: GenomeId = "562.7587".parse().unwrap();
        assert_eq!(
            ArtifactKind::Contigs.remote_path(&id),
            "genomes/562.7587/562.7587.fna"
        );
        assert_eq!(
            ArtifactKind::Features.remote_path(&id),
            "genomes/562.7587/562.7587.PATRIC.features.tab"
        );
    }

    #[test]
    fn selection_preserves_kind_order() {
        let selection =
            ArtifactSelection::from_kinds(&[ArtifactKind::Features, ArtifactKind::Contigs]);
        let kinds: Vec<_> = selection.kinds().collect();
        assert_eq!(kinds, vec![ArtifactKind::Contigs, ArtifactKind::Features]);
        assert!(ArtifactSelection::default().is_empty());
    }

    #[test]
    fn sanitize_replaces_spaces() {
        assert_eq!(sanitize_name("Escherichia coli K-12"), "Escherichia-coli-K-12");
        assert_eq!(sanitize_name("a/b"), "a_b");
        assert_eq!(sanitize_name(".."), "_");
    }
}
