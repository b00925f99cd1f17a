//! Splits a novel's flat text into prologue, volumes and chapters, and attaches each
//! illustrated volume's images to the volume heading they belong to.
//!
//! Boundaries are whole lines. Volume headings are found first (known illustration
//! volume names plus generic markers), then chapter headings inside each volume.
//! Matching is leftmost-first and case-sensitive.

use crate::models::{Chapter, ChapterLayout, IllustrationSet, Resource, SegmentedText, Volume};
use crate::utils::paragraphs;
use anyhow::{Context, Result};
use regex::Regex;

/// Generic volume heading prefixes.
pub const VOLUME_PATTERNS: [&str; 4] = [
    r"第[一二三四五六七八九十百]+卷", // 第一卷
    r"短篇",
    r"SS\d*",
    r"特典",
];

/// Chapter headings; each must match the whole line.
pub const CHAPTER_PATTERNS: [&str; 6] = [
    r"第[一二三四五六七八九十零\d]+[章话节].*", // 第一章 Title, 第3话
    r"终章",
    r"序章",
    r"后记",
    r"Epilogue",
    r"Prologue",
];

/// Lines containing this marker are leftovers of the source format and are dropped.
pub const ILLUSTRATION_MARKER: &str = "插图";

#[derive(Debug, Clone)]
pub struct SegmenterRules {
    pub volume_patterns: Vec<String>,
    pub chapter_patterns: Vec<String>,
    pub noise_marker: String,
}

impl Default for SegmenterRules {
    fn default() -> Self {
        Self {
            volume_patterns: VOLUME_PATTERNS.iter().map(|p| p.to_string()).collect(),
            chapter_patterns: CHAPTER_PATTERNS.iter().map(|p| p.to_string()).collect(),
            noise_marker: ILLUSTRATION_MARKER.to_string(),
        }
    }
}

pub struct Segmenter {
    volume_patterns: Vec<String>,
    core_name: Option<Regex>,
    chapter_boundary: Option<Regex>,
    noise: Option<Regex>,
}

/// Text before the first heading, then (heading, body) pairs.
struct Split<'t> {
    prefix: &'t str,
    sections: Vec<(&'t str, &'t str)>,
}

fn split_on<'t>(boundary: Option<&Regex>, text: &'t str) -> Split<'t> {
    let Some(boundary) = boundary else {
        return Split {
            prefix: text,
            sections: Vec::new(),
        };
    };

    let headings: Vec<_> = boundary.find_iter(text).collect();
    let Some(first) = headings.first() else {
        return Split {
            prefix: text,
            sections: Vec::new(),
        };
    };

    let sections = headings
        .iter()
        .enumerate()
        .map(|(i, heading)| {
            let body_end = headings.get(i + 1).map(|next| next.start()).unwrap_or(text.len());
            (heading.as_str(), &text[heading.end()..body_end])
        })
        .collect();

    Split {
        prefix: &text[..first.start()],
        sections,
    }
}

fn alternation<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let patterns: Vec<&str> = patterns.into_iter().filter(|p| !p.is_empty()).collect();
    if patterns.is_empty() {
        None
    } else {
        Some(patterns.join("|"))
    }
}

impl Segmenter {
    pub fn new(rules: SegmenterRules) -> Result<Self> {
        let volume_alt = alternation(rules.volume_patterns.iter().map(String::as_str));
        let core_name = volume_alt
            .as_ref()
            .map(|alt| Regex::new(&format!("^(?:{})", alt)))
            .transpose()
            .context("invalid volume pattern")?;

        let chapter_boundary = alternation(rules.chapter_patterns.iter().map(String::as_str))
            .map(|alt| Regex::new(&format!("(?m)^(?:{})$", alt)))
            .transpose()
            .context("invalid chapter pattern")?;

        let noise = if rules.noise_marker.is_empty() {
            None
        } else {
            Some(Regex::new(&format!(".*{}.*", regex::escape(&rules.noise_marker)))?)
        };

        Ok(Self {
            volume_patterns: rules.volume_patterns,
            core_name,
            chapter_boundary,
            noise,
        })
    }

    /// The structural prefix of a heading ("第一卷 :副标题" -> "第一卷"), or the whole
    /// heading when no volume pattern matches its start.
    pub fn core_name(&self, heading: &str) -> String {
        let heading = heading.trim();
        self.core_name
            .as_ref()
            .and_then(|re| re.find(heading))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| heading.to_string())
    }

    /// Volume boundary for one run: known names first, then the generic patterns.
    fn volume_boundary<'a>(&self, known_names: impl Iterator<Item = &'a str>) -> Result<Option<Regex>> {
        let escaped: Vec<String> = known_names
            .filter(|name| !name.trim().is_empty())
            .map(regex::escape)
            .collect();
        let alt = alternation(
            escaped
                .iter()
                .map(String::as_str)
                .chain(self.volume_patterns.iter().map(String::as_str)),
        );

        alt.map(|alt| Regex::new(&format!("(?m)^(?:{}).*$", alt)))
            .transpose()
            .context("failed to build volume boundary")
    }

    /// Segments `text`, consuming the volumes of `illustrations` whose core name
    /// matches a heading. Unmatched illustration volumes are returned in `unplaced`.
    pub fn segment(&self, text: &str, illustrations: IllustrationSet) -> Result<SegmentedText> {
        let boundary = self.volume_boundary(illustrations.volume_names())?;

        let mut pending: Vec<(String, String, Vec<Resource>)> = illustrations
            .into_iter()
            .map(|(name, resources)| (self.core_name(&name), name, resources))
            .collect();

        let split = split_on(boundary.as_ref(), text);
        let prologue = paragraphs(split.prefix);
        let mut volumes = Vec::with_capacity(split.sections.len());

        for (heading, body) in split.sections {
            let name = heading.trim().to_string();
            let core = self.core_name(&name);

            let illustrations = match pending.iter().position(|(c, _, _)| *c == core) {
                Some(index) => {
                    let (_, source, resources) = pending.remove(index);
                    tracing::debug!("volume {} takes {} illustrations from {}", name, resources.len(), source);
                    resources
                }
                None => Vec::new(),
            };

            let (chapters, layout) = self.chapters(&name, body.trim());
            volumes.push(Volume {
                name,
                chapters,
                illustrations,
                layout,
            });
        }

        let mut unplaced = IllustrationSet::new();
        for (_, name, resources) in pending {
            tracing::warn!("no heading matched illustration volume {}", name);
            unplaced.insert(name, resources);
        }

        tracing::info!(
            volumes = volumes.len(),
            chapters = volumes.iter().map(|v| v.chapters.len()).sum::<usize>(),
            prologue = !prologue.is_empty(),
            "text segmented"
        );

        Ok(SegmentedText {
            prologue,
            volumes,
            unplaced,
        })
    }

    fn chapters(&self, volume_name: &str, body: &str) -> (Vec<Chapter>, ChapterLayout) {
        let body = match &self.noise {
            Some(noise) => noise.replace_all(body, ""),
            None => body.into(),
        };

        let split = split_on(self.chapter_boundary.as_ref(), &body);

        if split.sections.is_empty() {
            let whole = body.trim();
            if whole.is_empty() {
                return (Vec::new(), ChapterLayout::WholeVolume);
            }
            let chapter = Chapter {
                title: volume_name.to_string(),
                paragraphs: paragraphs(whole)
                    .into_iter()
                    .filter(|line| line != volume_name)
                    .collect(),
            };
            return (vec![chapter], ChapterLayout::WholeVolume);
        }

        let intro = split.prefix.trim();
        let chapters = split
            .sections
            .iter()
            .enumerate()
            .map(|(i, (title, text))| {
                let text = text.trim();
                let paragraphs = if i == 0 && !intro.is_empty() {
                    paragraphs(&format!("{}\n{}", intro, text))
                } else {
                    paragraphs(text)
                };
                Chapter {
                    title: title.trim().to_string(),
                    paragraphs,
                }
            })
            .collect();

        (chapters, ChapterLayout::Detected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn rules(volumes: &[&str], chapters: &[&str]) -> SegmenterRules {
        SegmenterRules {
            volume_patterns: volumes.iter().map(|s| s.to_string()).collect(),
            chapter_patterns: chapters.iter().map(|s| s.to_string()).collect(),
            noise_marker: ILLUSTRATION_MARKER.to_string(),
        }
    }

    fn images(names: &[&str]) -> Vec<Resource> {
        names
            .iter()
            .map(|n| Resource {
                name: n.to_string(),
                path: PathBuf::from(n),
                fingerprint: String::new(),
            })
            .collect()
    }

    fn shape(text: &SegmentedText) -> Vec<(String, Vec<(String, usize)>)> {
        text.volumes
            .iter()
            .map(|v| {
                (
                    v.name.clone(),
                    v.chapters
                        .iter()
                        .map(|c| (c.title.clone(), c.paragraphs.len()))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn prologue_volume_and_two_chapters() {
        let segmenter = Segmenter::new(rules(&["第一卷"], &["CH1", "CH2"])).unwrap();
        let text = "PROLOGUE TEXT\n第一卷 Title\nCH1\nparagraph A\nCH2\nparagraph B";

        let result = segmenter.segment(text, IllustrationSet::new()).unwrap();

        assert_eq!(result.prologue, vec!["PROLOGUE TEXT"]);
        assert_eq!(result.volumes.len(), 1);
        let volume = &result.volumes[0];
        assert_eq!(volume.name, "第一卷 Title");
        assert_eq!(volume.layout, ChapterLayout::Detected);
        assert_eq!(volume.chapters.len(), 2);
        assert_eq!(volume.chapters[0].title, "CH1");
        assert_eq!(volume.chapters[0].paragraphs, vec!["paragraph A"]);
        assert_eq!(volume.chapters[1].title, "CH2");
        assert_eq!(volume.chapters[1].paragraphs, vec!["paragraph B"]);
    }

    #[test]
    fn segmenting_twice_gives_the_same_tree() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let text = "前言\n第一卷 开端\n序章\n一\n二\n第一章 相遇\n三\n第二卷 :副标题\n第1话\n四\n后记\n五";
        let mut set = IllustrationSet::new();
        set.insert("第二卷 副标题", images(&["1.jpg", "2.jpg"]));

        let a = segmenter.segment(text, set.clone()).unwrap();
        let b = segmenter.segment(text, set).unwrap();

        assert_eq!(shape(&a), shape(&b));
        assert_eq!(a, b);
        assert_eq!(
            shape(&a),
            vec![
                (
                    "第一卷 开端".to_string(),
                    vec![("序章".to_string(), 2), ("第一章 相遇".to_string(), 1)]
                ),
                (
                    "第二卷 :副标题".to_string(),
                    vec![("第1话".to_string(), 1), ("后记".to_string(), 1)]
                ),
            ]
        );
    }

    #[test]
    fn volume_without_chapter_headings_becomes_one_chapter() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let text = "短篇 夏日\n  第一段\n\n第二段  \n";

        let result = segmenter.segment(text, IllustrationSet::new()).unwrap();

        let volume = &result.volumes[0];
        assert_eq!(volume.layout, ChapterLayout::WholeVolume);
        assert_eq!(volume.chapters.len(), 1);
        assert_eq!(volume.chapters[0].title, "短篇 夏日");
        assert_eq!(volume.chapters[0].paragraphs.join("\n"), "第一段\n第二段");
    }

    #[test]
    fn empty_volume_has_no_chapters() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let result = segmenter.segment("特典\n\n特典2\n正文", IllustrationSet::new()).unwrap();
        assert_eq!(result.volumes.len(), 2);
        assert!(result.volumes[0].chapters.is_empty());
        assert_eq!(result.volumes[1].chapters[0].paragraphs, vec!["正文"]);
    }

    #[test]
    fn intro_text_goes_to_first_chapter_only() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let text = "第一卷\n卷首语\n第一章\n甲\n第二章\n乙";

        let result = segmenter.segment(text, IllustrationSet::new()).unwrap();

        let chapters = &result.volumes[0].chapters;
        assert_eq!(chapters[0].paragraphs, vec!["卷首语", "甲"]);
        assert_eq!(chapters[1].paragraphs, vec!["乙"]);
    }

    #[test]
    fn illustrations_attach_by_core_name_and_noise_is_removed() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let text = "第一卷 :副标题\n插图\n第一章\n正文一\n（插图010）\n正文二\n第二卷\n第一章\n正文三";
        let mut set = IllustrationSet::new();
        set.insert("第一卷 副标题", images(&["a.jpg", "b.jpg"]));
        set.insert("第九卷", images(&["z.jpg"]));

        let result = segmenter.segment(text, set).unwrap();

        let first = &result.volumes[0];
        assert_eq!(first.illustrations.len(), 2);
        assert_eq!(first.chapters.len(), 1);
        assert_eq!(first.chapters[0].paragraphs, vec!["正文一", "正文二"]);
        assert!(result.volumes[1].illustrations.is_empty());

        let unplaced: Vec<&str> = result.unplaced.volume_names().collect();
        assert_eq!(unplaced, vec!["第九卷"]);
    }

    #[test]
    fn known_illustration_names_are_volume_boundaries() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let mut set = IllustrationSet::new();
        set.insert("外传 (1+1)", images(&["x.png"]));

        let result = segmenter
            .segment("开头\n外传 (1+1)\n第一章\n内容", set)
            .unwrap();

        assert_eq!(result.prologue, vec!["开头"]);
        assert_eq!(result.volumes.len(), 1);
        assert_eq!(result.volumes[0].name, "外传 (1+1)");
        assert_eq!(result.volumes[0].illustrations.len(), 1);
        assert!(result.unplaced.is_empty());
    }

    #[test]
    fn boundaries_are_line_anchored_and_case_sensitive() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let text = "他读完了第一卷。\n第一卷\nprologue\n正文\nPrologue\n尾声";

        let result = segmenter.segment(text, IllustrationSet::new()).unwrap();

        assert_eq!(result.prologue, vec!["他读完了第一卷。"]);
        let chapters = &result.volumes[0].chapters;
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "Prologue");
        assert_eq!(chapters[0].paragraphs, vec!["prologue", "正文", "尾声"]);
    }

    #[test]
    fn text_without_volumes_is_all_prologue() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        let result = segmenter.segment("只有\n正文", IllustrationSet::new()).unwrap();
        assert_eq!(result.prologue, vec!["只有", "正文"]);
        assert!(result.volumes.is_empty());
    }

    #[test]
    fn core_name_strips_descriptive_suffix() {
        let segmenter = Segmenter::new(SegmenterRules::default()).unwrap();
        assert_eq!(segmenter.core_name("第一卷 :副标题"), "第一卷");
        assert_eq!(segmenter.core_name("SS2 番外"), "SS2");
        assert_eq!(segmenter.core_name("外传"), "外传");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(Segmenter::new(rules(&["("], &[])).is_err());
    }
}
