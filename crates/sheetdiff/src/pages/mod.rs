//! Page extraction and old/new sheet pairing.

pub mod extractor;
pub mod sheet_name;

use std::collections::{HashMap, HashSet};

use crate::pipeline::model::Page;

pub use extractor::{ExtractedPage, PageExtractor};
pub use sheet_name::{find_sheet_number, infer_sheet_name};

/// One old/new sheet pair to diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePair {
    pub old_page_number: u32,
    pub new_page_number: u32,
    pub drawing_name: String,
}

/// Pairs the pages of two versions.
///
/// Pages whose drawing name is unique on both sides pair by name; the rest
/// pair by equal page number. Pages left without a partner are not diffed.
/// Pairs come back ordered by new page number.
pub fn pair_pages(old: &[Page], new: &[Page]) -> Vec<PagePair> {
    let old_by_name = unique_names(old);
    let new_by_name = unique_names(new);

    let mut pairs = Vec::new();
    let mut used_old = HashSet::new();
    let mut used_new = HashSet::new();

    for (name, new_page) in &new_by_name {
        if let Some(old_page) = old_by_name.get(name) {
            pairs.push(PagePair {
                old_page_number: old_page.page_number,
                new_page_number: new_page.page_number,
                drawing_name: new_page.drawing_name.clone(),
            });
            used_old.insert(old_page.page_number);
            used_new.insert(new_page.page_number);
        }
    }

    let old_by_number: HashMap<u32, &Page> = old
        .iter()
        .filter(|p| !used_old.contains(&p.page_number))
        .map(|p| (p.page_number, p))
        .collect();
    for new_page in new.iter().filter(|p| !used_new.contains(&p.page_number)) {
        if old_by_number.contains_key(&new_page.page_number) {
            pairs.push(PagePair {
                old_page_number: new_page.page_number,
                new_page_number: new_page.page_number,
                drawing_name: new_page.drawing_name.clone(),
            });
        }
    }

    pairs.sort_by_key(|p| p.new_page_number);
    pairs
}

fn unique_names(pages: &[Page]) -> HashMap<&str, &Page> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for page in pages {
        *counts.entry(page.drawing_name.as_str()).or_default() += 1;
    }
    pages
        .iter()
        .filter(|p| counts.get(p.drawing_name.as_str()) == Some(&1))
        .map(|p| (p.drawing_name.as_str(), p))
        .collect()
}
