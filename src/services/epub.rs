use crate::services::assembler::{
    Document, DocumentSink, NAV_TITLE, PageKind, STYLESHEET, TocEntry,
};
use anyhow::{Context, Result, anyhow};
use epub_builder::{EpubBuilder, EpubContent, ReferenceType, TocElement, ZipLibrary};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Writes documents as EPUB files.
#[derive(Debug, Default)]
pub struct EpubSink;

fn builder_error(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("epub builder: {}", e)
}

impl DocumentSink for EpubSink {
    fn write(&self, document: &Document, dest: &Path) -> Result<()> {
        let mut builder =
            EpubBuilder::new(ZipLibrary::new().map_err(builder_error)?).map_err(builder_error)?;

        builder
            .metadata("title", document.title.as_str())
            .map_err(builder_error)?;
        builder
            .metadata("author", document.author.as_str())
            .map_err(builder_error)?;
        builder
            .metadata("lang", document.language.as_str())
            .map_err(builder_error)?;
        builder
            .metadata("toc_name", NAV_TITLE)
            .map_err(builder_error)?;
        builder
            .stylesheet(STYLESHEET.as_bytes())
            .map_err(builder_error)?;

        if let Some(cover) = &document.cover {
            match fs::read(&cover.path) {
                Ok(bytes) => {
                    builder
                        .add_cover_image(&cover.href, bytes.as_slice(), cover.media_type)
                        .map_err(builder_error)?;
                }
                Err(e) => tracing::warn!("skipping cover {}: {}", cover.path.display(), e),
            }
        }

        for resource in &document.resources {
            match fs::read(&resource.path) {
                Ok(bytes) => {
                    builder
                        .add_resource(&resource.href, bytes.as_slice(), resource.media_type)
                        .map_err(builder_error)?;
                }
                Err(e) => tracing::warn!("skipping resource {}: {}", resource.path.display(), e),
            }
        }

        // The page that opens each top-level entry carries that entry in the toc.
        let entries: HashMap<&str, &TocEntry> = document
            .toc
            .iter()
            .filter_map(|entry| match entry {
                TocEntry::Link(link) => Some((link.href.as_str(), entry)),
                TocEntry::Section { children, .. } => {
                    children.first().map(|first| (first.href.as_str(), entry))
                }
            })
            .collect();

        for page in &document.spine {
            if page.kind == PageKind::Navigation {
                builder.inline_toc();
                continue;
            }

            let mut content = EpubContent::new(page.href.as_str(), page.xhtml.as_bytes());
            match entries.get(page.href.as_str()) {
                Some(TocEntry::Link(link)) => {
                    content = content.title(link.title.as_str());
                }
                Some(TocEntry::Section { title, children }) => {
                    content = content.title(title.as_str());
                    for child in children {
                        content = content
                            .child(TocElement::new(child.href.as_str(), child.title.as_str()));
                    }
                }
                None => {}
            }
            if page.kind == PageKind::Cover {
                content = content.reftype(ReferenceType::Cover);
            }
            builder.add_content(content).map_err(builder_error)?;
        }

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut partial = dest.as_os_str().to_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let file = File::create(&partial)
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        builder.generate(file).map_err(builder_error)?;
        fs::rename(&partial, dest)
            .with_context(|| format!("Failed to move EPUB into {}", dest.display()))?;

        tracing::info!(
            pages = document.spine.len(),
            resources = document.resources.len(),
            "EPUB written to {}",
            dest.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Book, BookMetadata, Chapter, ChapterLayout, IllustrationSet, Resource, SegmentedText,
        Volume,
    };
    use crate::services::assembler::assemble;
    use std::io::Read;
    use tempfile::TempDir;

    fn write(path: &Path, bytes: &[u8]) -> Resource {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
        Resource {
            name: path.file_name().unwrap().to_string_lossy().into_owned(),
            path: path.to_path_buf(),
            fingerprint: String::new(),
        }
    }

    fn entry(archive: &mut zip::ZipArchive<File>, suffix: &str) -> Option<String> {
        let name = archive
            .file_names()
            .find(|n| n.ends_with(suffix))
            .map(str::to_string)?;
        let mut text = String::new();
        archive.by_name(&name).ok()?.read_to_string(&mut text).ok()?;
        Some(text)
    }

    #[test]
    fn writes_pages_images_and_toc() {
        let dir = TempDir::new().unwrap();
        let cover = write(&dir.path().join("cover.jpg"), b"\xFF\xD8cover");
        let illustration = write(&dir.path().join("第一卷").join("a.jpg"), b"\xFF\xD8img");

        let book = Book {
            title: "测试书".into(),
            language: "zh".into(),
            metadata: BookMetadata::default(),
            cover: Some(cover),
            text: SegmentedText {
                prologue: vec!["开场".into()],
                volumes: vec![Volume {
                    name: "第一卷 开端".into(),
                    chapters: vec![Chapter {
                        title: "第一章 相遇".into(),
                        paragraphs: vec!["正文".into()],
                    }],
                    illustrations: vec![illustration],
                    layout: ChapterLayout::Detected,
                }],
                unplaced: IllustrationSet::new(),
            },
        };

        let dest = dir.path().join("out").join("测试书.epub");
        EpubSink.write(&assemble(&book), &dest).unwrap();

        assert!(dest.exists());
        assert!(!dir.path().join("out").join("测试书.epub.part").exists());

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert!(archive.file_names().any(|n| n == "mimetype"));
        assert!(archive.file_names().any(|n| n.ends_with("images/第一卷/a.jpg")));
        assert!(archive.file_names().any(|n| n.ends_with("images/cover.jpg")));

        let chapter = entry(&mut archive, "vol_1_chap_1.xhtml").unwrap();
        assert!(chapter.contains("<p>正文</p>"));

        let ncx = entry(&mut archive, ".ncx").unwrap();
        assert!(ncx.contains("第一卷 开端"));
        assert!(ncx.contains("第一章 相遇"));
        assert!(ncx.contains("简介"));

        let toc = entry(&mut archive, "toc.xhtml").unwrap();
        assert!(toc.contains(NAV_TITLE));
    }

    #[test]
    fn missing_resource_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut text = SegmentedText::default();
        text.unplaced.insert(
            "第二卷",
            vec![Resource {
                name: "gone.jpg".into(),
                path: dir.path().join("第二卷").join("gone.jpg"),
                fingerprint: String::new(),
            }],
        );
        let book = Book {
            title: "空".into(),
            language: "zh".into(),
            metadata: BookMetadata::default(),
            cover: None,
            text,
        };

        let dest = dir.path().join("空.epub");
        EpubSink.write(&assemble(&book), &dest).unwrap();

        let archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert!(!archive.file_names().any(|n| n.ends_with("gone.jpg")));
    }
}
