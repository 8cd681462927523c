//! Document loaders: turn a user-supplied file or sitemap URL into
//! [`DocumentSource`](docchat_core::models::DocumentSource)s.
//!
//! | Loader | Input | Output |
//! |--------|-------|--------|
//! | [`file::load_file`] | `.txt`, `.md`, `.pdf`, `.docx` path | one source |
//! | [`sitemap::SitemapLoader`] | `https://…/sitemap.xml` | one source per page |

pub mod file;
pub mod sitemap;
