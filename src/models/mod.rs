use std::path::PathBuf;

pub const UNKNOWN_AUTHOR: &str = "未知";
pub const EMPTY_SYNOPSIS: &str = "无";

/// A verified file on disk: a volume illustration, the cover or the text asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Volume-relative file name.
    pub name: String,
    pub path: PathBuf,
    pub fingerprint: String,
}

/// Illustration resources grouped by volume name, in discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IllustrationSet {
    volumes: Vec<(String, Vec<Resource>)>,
}

impl IllustrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a volume, replacing any earlier entry with the same name in place.
    pub fn insert(&mut self, volume: impl Into<String>, resources: Vec<Resource>) {
        let volume = volume.into();
        match self.volumes.iter_mut().find(|(name, _)| *name == volume) {
            Some(entry) => entry.1 = resources,
            None => self.volumes.push((volume, resources)),
        }
    }

    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Resource])> {
        self.volumes
            .iter()
            .map(|(name, resources)| (name.as_str(), resources.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn resource_count(&self) -> usize {
        self.volumes.iter().map(|(_, resources)| resources.len()).sum()
    }
}

impl IntoIterator for IllustrationSet {
    type Item = (String, Vec<Resource>);
    type IntoIter = std::vec::IntoIter<(String, Vec<Resource>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.volumes.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookMetadata {
    pub author: String,
    pub synopsis: String,
    pub cover_url: Option<String>,
}

impl Default for BookMetadata {
    fn default() -> Self {
        Self {
            author: UNKNOWN_AUTHOR.to_string(),
            synopsis: EMPTY_SYNOPSIS.to_string(),
            cover_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub paragraphs: Vec<String>,
}

/// How a volume's chapters were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterLayout {
    /// Chapter headings were found inside the volume.
    Detected,
    /// No headings matched; the volume body is kept as one chapter.
    WholeVolume,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub name: String,
    pub chapters: Vec<Chapter>,
    pub illustrations: Vec<Resource>,
    pub layout: ChapterLayout,
}

/// Output of the segmenter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentedText {
    pub prologue: Vec<String>,
    pub volumes: Vec<Volume>,
    /// Illustration volumes whose name never matched a heading.
    pub unplaced: IllustrationSet,
}

/// One collection ready for assembly.
#[derive(Debug, Clone)]
pub struct Book {
    pub title: String,
    pub language: String,
    pub metadata: BookMetadata,
    pub cover: Option<Resource>,
    pub text: SegmentedText,
}
