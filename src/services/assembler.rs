use crate::models::{Book, ChapterLayout, Resource};
use crate::utils::media_type_for;
use anyhow::Result;
use html_escape::{encode_double_quoted_attribute, encode_text};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const COVER_TITLE: &str = "封面";
pub const NAV_TITLE: &str = "目录";
pub const SYNOPSIS_TITLE: &str = "简介";
pub const PROLOGUE_TITLE: &str = "序章";

pub const STYLESHEET: &str = r#"body { font-family: Times, serif; }
h1, h2 { text-align: center; font-weight: bold; }
p { text-indent: 2em; margin: 0; padding: 0; line-height: 1.6; }
.cover { margin: 0; padding: 0; text-align: center; }
.cover img { max-width: 100%; max-height: 100vh; }
.illustration { text-align: center; margin: 1em 0; page-break-before: always; }
img { max-width: 100%; height: auto; display: block; margin-left: auto; margin-right: auto; }
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Cover,
    /// Placeholder; the sink renders the navigation document itself.
    Navigation,
    Synopsis,
    Prologue,
    Illustrations,
    Chapter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub href: String,
    pub title: String,
    pub kind: PageKind,
    pub xhtml: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocLink {
    pub href: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TocEntry {
    Link(TocLink),
    Section { title: String, children: Vec<TocLink> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedResource {
    pub href: String,
    pub path: PathBuf,
    pub media_type: &'static str,
}

/// A fully structured book, independent of the container format.
#[derive(Debug, Clone)]
pub struct Document {
    pub title: String,
    pub author: String,
    pub language: String,
    pub cover: Option<EmbeddedResource>,
    pub spine: Vec<Page>,
    pub toc: Vec<TocEntry>,
    pub resources: Vec<EmbeddedResource>,
}

/// Serializes a `Document` into a distributable file.
pub trait DocumentSink {
    fn write(&self, document: &Document, dest: &Path) -> Result<()>;
}

fn xhtml(title: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
<meta charset="UTF-8"/>
<title>{}</title>
<link rel="stylesheet" type="text/css" href="stylesheet.css"/>
</head>
<body>
{}
</body>
</html>
"#,
        encode_text(title),
        body
    )
}

fn text_page(heading: &str, paragraphs: &[String]) -> String {
    let mut body = format!("<h1>{}</h1>\n", encode_text(heading));
    for paragraph in paragraphs {
        body.push_str(&format!("<p>{}</p>\n", encode_text(paragraph)));
    }
    xhtml(heading, &body)
}

fn image_href(resource: &Resource) -> String {
    let volume_dir = resource
        .path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());
    match volume_dir {
        Some(dir) => format!("images/{}/{}", dir, resource.name),
        None => format!("images/{}", resource.name),
    }
}

#[derive(Default)]
struct ResourceTable {
    seen: HashSet<String>,
    resources: Vec<EmbeddedResource>,
}

impl ResourceTable {
    fn add(&mut self, resource: &Resource) -> String {
        let href = image_href(resource);
        if self.seen.insert(href.clone()) {
            self.resources.push(EmbeddedResource {
                href: href.clone(),
                path: resource.path.clone(),
                media_type: media_type_for(&resource.path),
            });
        }
        href
    }
}

/// Lays out `book` as cover, navigation, synopsis, prologue, then each volume's
/// illustration page followed by its chapters.
pub fn assemble(book: &Book) -> Document {
    let mut spine = Vec::new();
    let mut toc = Vec::new();
    let mut table = ResourceTable::default();

    let cover = book.cover.as_ref().map(|resource| {
        let ext = resource
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "jpg".to_string());
        EmbeddedResource {
            href: format!("images/cover.{}", ext),
            path: resource.path.clone(),
            media_type: media_type_for(&resource.path),
        }
    });

    if let Some(cover) = &cover {
        let body = format!(
            r#"<div class="cover"><img src="{}" alt="{}"/></div>"#,
            encode_double_quoted_attribute(&cover.href),
            COVER_TITLE
        );
        spine.push(Page {
            href: "cover.xhtml".to_string(),
            title: COVER_TITLE.to_string(),
            kind: PageKind::Cover,
            xhtml: xhtml(COVER_TITLE, &body),
        });
    }

    spine.push(Page {
        href: "nav.xhtml".to_string(),
        title: NAV_TITLE.to_string(),
        kind: PageKind::Navigation,
        xhtml: String::new(),
    });

    let synopsis: Vec<String> = book
        .metadata
        .synopsis
        .lines()
        .map(|line| line.replace("\u{3000}\u{3000}", "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    spine.push(Page {
        href: "synopsis.xhtml".to_string(),
        title: SYNOPSIS_TITLE.to_string(),
        kind: PageKind::Synopsis,
        xhtml: text_page(SYNOPSIS_TITLE, &synopsis),
    });
    toc.push(TocEntry::Link(TocLink {
        href: "synopsis.xhtml".to_string(),
        title: SYNOPSIS_TITLE.to_string(),
    }));

    if !book.text.prologue.is_empty() {
        spine.push(Page {
            href: "prologue.xhtml".to_string(),
            title: PROLOGUE_TITLE.to_string(),
            kind: PageKind::Prologue,
            xhtml: text_page(PROLOGUE_TITLE, &book.text.prologue),
        });
        toc.push(TocEntry::Link(TocLink {
            href: "prologue.xhtml".to_string(),
            title: PROLOGUE_TITLE.to_string(),
        }));
    }

    for (index, volume) in book.text.volumes.iter().enumerate() {
        let v = index + 1;

        if !volume.illustrations.is_empty() {
            let mut body = String::new();
            for resource in &volume.illustrations {
                let href = table.add(resource);
                body.push_str(&format!(
                    "<div class=\"illustration\"><img src=\"{}\" alt=\"插图\"/></div>\n",
                    encode_double_quoted_attribute(&href)
                ));
            }
            let title = format!("{} 插图", volume.name);
            spine.push(Page {
                href: format!("illust_{}.xhtml", v),
                xhtml: xhtml(&title, &body),
                title,
                kind: PageKind::Illustrations,
            });
        }

        match volume.layout {
            ChapterLayout::WholeVolume => {
                if let Some(chapter) = volume.chapters.first() {
                    let href = format!("vol_{}_full.xhtml", v);
                    spine.push(Page {
                        href: href.clone(),
                        title: volume.name.clone(),
                        kind: PageKind::Chapter,
                        xhtml: text_page(&volume.name, &chapter.paragraphs),
                    });
                    toc.push(TocEntry::Link(TocLink {
                        href,
                        title: volume.name.clone(),
                    }));
                }
            }
            ChapterLayout::Detected => {
                let mut children = Vec::with_capacity(volume.chapters.len());
                for (c, chapter) in volume.chapters.iter().enumerate() {
                    let href = format!("vol_{}_chap_{}.xhtml", v, c + 1);
                    spine.push(Page {
                        href: href.clone(),
                        title: chapter.title.clone(),
                        kind: PageKind::Chapter,
                        xhtml: text_page(&chapter.title, &chapter.paragraphs),
                    });
                    children.push(TocLink {
                        href,
                        title: chapter.title.clone(),
                    });
                }
                if !children.is_empty() {
                    toc.push(TocEntry::Section {
                        title: volume.name.clone(),
                        children,
                    });
                }
            }
        }
    }

    for (volume, resources) in book.text.unplaced.iter() {
        tracing::debug!("embedding {} unplaced illustrations of {}", resources.len(), volume);
        for resource in resources {
            table.add(resource);
        }
    }

    Document {
        title: book.title.clone(),
        author: book.metadata.author.clone(),
        language: book.language.clone(),
        cover,
        spine,
        toc,
        resources: table.resources,
    }
}
