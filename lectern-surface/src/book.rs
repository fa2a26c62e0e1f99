//! Books stored as directories: an unpacked EPUB (container + package
//! document) or a plain folder of chapter files read in name order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info, instrument, warn};

use lectern_core::{
    book_id_for_path, BookInfo, BookMetadata, BookProvider, ChapterContent, ChapterStore,
    SpineItem,
};

const CONTAINER_PATH: &str = "META-INF/container.xml";
const CHAPTER_EXTENSIONS: &[&str] = &["xhtml", "html", "htm", "txt"];
const CACHE_CAPACITY: usize = 12;

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryBookProvider;

impl DirectoryBookProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BookProvider for DirectoryBookProvider {
    async fn open(&self, path: &Path) -> Result<Arc<dyn ChapterStore>> {
        let canonical = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("failed to resolve book path {:?}", path))?;
        let store = DirectoryChapterStore::open(&canonical).await?;
        Ok(Arc::new(store))
    }
}

/// Reading order and metadata from a package document.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Package {
    pub metadata: BookMetadata,
    pub spine: Vec<(String, bool)>,
}

pub struct DirectoryChapterStore {
    info: BookInfo,
    content_root: PathBuf,
    cache: Mutex<HashMap<usize, ChapterContent>>,
}

impl DirectoryChapterStore {
    #[instrument]
    pub async fn open(root: &Path) -> Result<Self> {
        let container = root.join(CONTAINER_PATH);
        let (content_root, package) = if tokio::fs::try_exists(&container).await.unwrap_or(false) {
            let raw = tokio::fs::read_to_string(&container)
                .await
                .with_context(|| format!("failed to read {:?}", container))?;
            let rootfile = parse_container(&raw)?
                .ok_or_else(|| anyhow!("{:?} names no rootfile", container))?;
            let opf = root.join(&rootfile);
            let raw = tokio::fs::read_to_string(&opf)
                .await
                .with_context(|| format!("failed to read package document {:?}", opf))?;
            let package = parse_package(&raw)
                .with_context(|| format!("failed to parse package document {:?}", opf))?;
            let content_root = opf.parent().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
            (content_root, package)
        } else {
            (root.to_path_buf(), scan_directory(root).await?)
        };

        if package.spine.is_empty() {
            bail!("no readable chapters found in {:?}", root);
        }

        let mut metadata = package.metadata;
        if metadata.title.is_none() {
            metadata.title = root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }
        let spine = package
            .spine
            .into_iter()
            .enumerate()
            .map(|(index, (href, linear))| SpineItem {
                index,
                href,
                linear,
            })
            .collect::<Vec<_>>();
        info!(
            path = %root.display(),
            chapters = spine.len(),
            title = metadata.title.as_deref().unwrap_or_default(),
            "opened book directory"
        );

        Ok(Self {
            info: BookInfo {
                id: book_id_for_path(root),
                path: root.to_path_buf(),
                spine,
                metadata,
            },
            content_root,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn chapter_path(&self, href: &str) -> PathBuf {
        let (path, _) = lectern_core::split_fragment(href);
        self.content_root.join(path)
    }

    fn try_get_cached(&self, index: usize) -> Option<ChapterContent> {
        self.cache.lock().get(&index).cloned()
    }

    fn store_cached(&self, content: &ChapterContent) {
        let mut cache = self.cache.lock();
        cache.insert(content.index, content.clone());

        if cache.len() > CACHE_CAPACITY {
            let mut keys: Vec<_> = cache.keys().copied().collect();
            keys.sort_by_key(|index| index.abs_diff(content.index));
            for stale in keys.into_iter().skip(CACHE_CAPACITY) {
                cache.remove(&stale);
            }
        }
    }

    pub fn cached_chapters(&self) -> usize {
        self.cache.lock().len()
    }
}

#[async_trait]
impl ChapterStore for DirectoryChapterStore {
    fn info(&self) -> &BookInfo {
        &self.info
    }

    #[instrument(skip(self))]
    async fn fetch_chapter(&self, index: usize) -> Result<ChapterContent> {
        if let Some(content) = self.try_get_cached(index) {
            return Ok(content);
        }
        let item = self
            .info
            .spine
            .get(index)
            .ok_or_else(|| anyhow!("spine index {index} out of range"))?;
        let path = self.chapter_path(&item.href);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read chapter {:?}", path))?;
        let markup = match String::from_utf8(bytes) {
            Ok(markup) => markup,
            Err(err) => {
                warn!(path = %path.display(), "chapter is not valid UTF-8, decoding lossily");
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        };
        debug!(index, bytes = markup.len(), "chapter fetched");
        let content = ChapterContent {
            index,
            href: item.href.clone(),
            markup,
        };
        self.store_cached(&content);
        Ok(content)
    }
}

async fn scan_directory(root: &Path) -> Result<Package> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("failed to list book directory {:?}", root))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let is_chapter = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| CHAPTER_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_chapter {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(Package {
        metadata: BookMetadata::default(),
        spine: names.into_iter().map(|name| (name, true)).collect(),
    })
}

fn xml_reader(raw: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);
    reader
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}

/// Path of the first rootfile named by `META-INF/container.xml`.
pub fn parse_container(raw: &str) -> Result<Option<String>> {
    let mut reader = xml_reader(raw);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attribute(&e, b"full-path") {
                    return Ok(Some(path));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Reads metadata, manifest and spine from an OPF package document. Spine
/// entries whose manifest item is missing are skipped.
pub fn parse_package(raw: &str) -> Result<Package> {
    #[derive(Clone, Copy, PartialEq)]
    enum Field {
        Title,
        Creator,
        Language,
    }

    let mut reader = xml_reader(raw);
    let mut metadata = BookMetadata::default();
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut itemrefs: Vec<(String, bool)> = Vec::new();
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"title" => field = Some(Field::Title),
                b"creator" => field = Some(Field::Creator),
                b"language" => field = Some(Field::Language),
                b"item" => {
                    if let (Some(id), Some(href)) = (attribute(&e, b"id"), attribute(&e, b"href")) {
                        manifest.insert(id, href);
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attribute(&e, b"idref") {
                        let linear = attribute(&e, b"linear").map_or(true, |value| value != "no");
                        itemrefs.push((idref, linear));
                    }
                }
                _ => {}
            },
            Event::Text(text) => {
                let Some(current) = field else {
                    continue;
                };
                let value = text.unescape()?.trim().to_string();
                let slot = match current {
                    Field::Title => &mut metadata.title,
                    Field::Creator => &mut metadata.author,
                    Field::Language => &mut metadata.language,
                };
                if slot.is_none() && !value.is_empty() {
                    *slot = Some(value);
                }
            }
            Event::End(_) => field = None,
            Event::Eof => break,
            _ => {}
        }
    }

    let spine = itemrefs
        .into_iter()
        .filter_map(|(idref, linear)| match manifest.get(&idref) {
            Some(href) => Some((href.clone(), linear)),
            None => {
                warn!(%idref, "spine item missing from manifest");
                None
            }
        })
        .collect();
    Ok(Package { metadata, spine })
}
