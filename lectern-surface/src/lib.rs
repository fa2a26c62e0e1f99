mod book;
mod grid;
mod markup;

pub use book::{parse_container, parse_package, DirectoryBookProvider, DirectoryChapterStore, Package};
pub use grid::{TextGridSurface, TextRun};
pub use markup::{parse_chapter, MarkupError, ParsedChapter, TextBlock};
