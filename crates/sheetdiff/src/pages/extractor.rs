use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, warn};

use crate::db::{page_repo, Database};
use crate::error::PageError;
use crate::imaging::codec::{decode, encode_png};
use crate::pages::sheet_name::infer_sheet_name;
use crate::pipeline::model::Page;
use crate::storage::ObjectStore;

/// One rasterized page of a source document.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// 1-based position in the source document.
    pub page_number: u32,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub drawing_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Pdf,
    Raster,
}

/// Splits PDFs and raster files into addressable sheet images.
#[derive(Debug, Clone)]
pub struct PageExtractor {
    dpi: u32,
}

impl Default for PageExtractor {
    fn default() -> Self {
        Self::new(crate::config::PagesConfig::default().dpi)
    }
}

impl PageExtractor {
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    pub fn extract(&self, bytes: &[u8], filename: &str) -> Result<Vec<ExtractedPage>, PageError> {
        let _span = tracing::info_span!("pages.extract", filename).entered();
        let stem = Path::new(filename).file_stem().and_then(|s| s.to_str());

        let pages = match detect_kind(bytes, filename)? {
            SourceKind::Pdf => self.extract_pdf(bytes, stem)?,
            SourceKind::Raster => {
                let image = decode(bytes)?;
                vec![ExtractedPage {
                    page_number: 1,
                    png: encode_png(&image)?,
                    width: image.width(),
                    height: image.height(),
                    drawing_name: infer_sheet_name(None, stem, 1, true),
                }]
            }
        };

        if pages.is_empty() {
            return Err(PageError::NoPages);
        }
        tracing::info!(pages = pages.len(), "Extracted pages");
        Ok(pages)
    }

    fn extract_pdf(&self, bytes: &[u8], stem: Option<&str>) -> Result<Vec<ExtractedPage>, PageError> {
        let source = TempPdf::write(bytes)?;
        // Page texts come from lopdf when it can parse the file; otherwise
        // poppler still renders it and names fall back to defaults.
        let texts: Vec<Option<String>> = match lopdf::Document::load_mem(bytes) {
            Ok(doc) => doc
                .get_pages()
                .keys()
                .map(|&n| doc.extract_text(&[n]).ok())
                .collect(),
            Err(e) => {
                warn!("lopdf failed to parse PDF: {}. Falling back to pdfinfo.", e);
                vec![None; count_pdf_pages(source.path())?]
            }
        };

        let single_page = texts.len() == 1;
        let mut pages = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let page_number = i as u32 + 1;
            let png = render_pdf_page(source.path(), page_number, self.dpi)?;
            let image = decode(&png).map_err(|e| PageError::Render {
                page: page_number,
                reason: e.to_string(),
            })?;
            debug!("Rendered page {} at {}x{}", page_number, image.width(), image.height());
            pages.push(ExtractedPage {
                page_number,
                png,
                width: image.width(),
                height: image.height(),
                drawing_name: infer_sheet_name(text.as_deref(), stem, page_number, single_page),
            });
        }
        Ok(pages)
    }

    /// Extracts `bytes`, stores every page PNG under
    /// `versions/<version>/pages/<n>.png` and upserts the page rows.
    pub fn ingest(
        &self,
        db: &Database,
        objects: &dyn ObjectStore,
        version_id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<Vec<Page>, PageError> {
        let extracted = self.extract(bytes, filename)?;
        let mut pages = Vec::with_capacity(extracted.len());
        for page in extracted {
            let image_ref = objects.put(
                &format!("versions/{}/pages/{}.png", version_id, page.page_number),
                &page.png,
            )?;
            let row = Page {
                version_id: version_id.to_string(),
                page_number: page.page_number,
                drawing_name: page.drawing_name,
                image_ref,
                width: page.width,
                height: page.height,
                ocr_ref: None,
                source_name: Some(filename.to_string()),
            };
            db.with_conn(|c| page_repo::upsert(c, &row))?;
            pages.push(row);
        }
        Ok(pages)
    }
}

fn detect_kind(bytes: &[u8], filename: &str) -> Result<SourceKind, PageError> {
    if bytes.starts_with(b"%PDF") {
        return Ok(SourceKind::Pdf);
    }
    let mime = mime_guess::from_path(filename).first();
    match mime {
        Some(m) if m.essence_str() == "application/pdf" => Ok(SourceKind::Pdf),
        Some(m) if m.type_() == mime_guess::mime::IMAGE => Ok(SourceKind::Raster),
        // Unknown extension: let the image decoder sniff the bytes.
        None if image::guess_format(bytes).is_ok() => Ok(SourceKind::Raster),
        other => Err(PageError::UnsupportedFormat(
            other.map(|m| m.to_string()).unwrap_or_else(|| filename.to_string()),
        )),
    }
}

/// A source PDF written once to the temp dir for the poppler tools,
/// removed on drop.
struct TempPdf {
    path: PathBuf,
}

impl TempPdf {
    fn write(bytes: &[u8]) -> Result<Self, PageError> {
        let path = std::env::temp_dir().join(format!("sheetdiff_src_{}.pdf", uuid::Uuid::new_v4()));
        std::fs::write(&path, bytes)
            .map_err(|e| PageError::PdfProcessing(format!("Failed to write temp PDF: {}", e)))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPdf {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Page count via pdfinfo (poppler-utils), for PDFs lopdf cannot parse.
fn count_pdf_pages(pdf_path: &Path) -> Result<usize, PageError> {
    let output = Command::new("pdfinfo").arg(pdf_path).output();
    let output = output.map_err(|e| {
        PageError::PdfProcessing(format!(
            "Failed to run pdfinfo: {}. Make sure poppler-utils is installed.",
            e
        ))
    })?;

    if !output.status.success() {
        return Err(PageError::PdfProcessing(format!(
            "pdfinfo failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|count| count.trim().parse::<usize>().ok())
        .ok_or_else(|| PageError::PdfProcessing("pdfinfo did not report a page count".to_string()))
}

/// Renders one page with pdftoppm.
fn render_pdf_page(pdf_path: &Path, page: u32, dpi: u32) -> Result<Vec<u8>, PageError> {
    let output_prefix = std::env::temp_dir().join(format!("sheetdiff_page_{}", uuid::Uuid::new_v4()));

    let output = Command::new("pdftoppm")
        .args(["-png", "-singlefile", "-r"])
        .arg(dpi.to_string())
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string())
        .arg(pdf_path)
        .arg(&output_prefix)
        .output();
    let output = output.map_err(|e| PageError::Render {
        page,
        reason: format!("failed to run pdftoppm: {}. Make sure poppler-utils is installed.", e),
    })?;

    if !output.status.success() {
        return Err(PageError::Render {
            page,
            reason: format!("pdftoppm failed: {}", String::from_utf8_lossy(&output.stderr)),
        });
    }

    // -singlefile writes `<prefix>.png` without a page suffix.
    let mut image_path = output_prefix.into_os_string();
    image_path.push(".png");
    let png = std::fs::read(&image_path).map_err(|e| PageError::Render {
        page,
        reason: format!("failed to read rendered image: {}", e),
    });
    let _ = std::fs::remove_file(&image_path);
    png
}
