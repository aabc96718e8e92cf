//! Page arithmetic shared by every provider variant

/// Window over a provider's nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOptions {
    pub start: usize,

    /// `None` reads to the end
    pub size: Option<usize>,
}

impl PageOptions {
    pub fn new(start: usize, size: usize) -> Self {
        Self {
            start,
            size: Some(size),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_paged(&self) -> bool {
        self.start > 0 || self.size.is_some()
    }
}

/// A node count and whether it is exact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountInfo {
    pub count: usize,

    /// `false` when the count is a lower bound
    pub is_accurate: bool,
}

impl CountInfo {
    pub fn exact(count: usize) -> Self {
        Self {
            count,
            is_accurate: true,
        }
    }
}

/// Number of nodes a page of `page` shows out of `total`
pub fn paged_count(total: usize, page: PageOptions) -> usize {
    if page.start >= total || page.size == Some(0) {
        return 0;
    }
    let available = total - page.start;
    match page.size {
        Some(size) => available.min(size),
        None => available,
    }
}

/// Split one page across consecutive children with the given counts
///
/// Children entirely before the page get an empty page; the first child the
/// page starts in is read from the remaining offset, later children from
/// their start, until the page size is used up.
pub fn split_page(counts: &[usize], page: PageOptions) -> Vec<PageOptions> {
    let mut skip = page.start;
    let mut remaining = page.size;
    counts
        .iter()
        .map(|&count| {
            if remaining == Some(0) || skip >= count {
                skip = skip.saturating_sub(count);
                return PageOptions::new(0, 0);
            }
            let start = skip;
            skip = 0;
            let available = count - start;
            match remaining {
                Some(size) => {
                    let take = available.min(size);
                    remaining = Some(size - take);
                    PageOptions::new(start, take)
                }
                None => PageOptions { start, size: None },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paged_count() {
        assert_eq!(paged_count(10, PageOptions::unbounded()), 10);
        assert_eq!(paged_count(10, PageOptions::new(8, 5)), 2);
        assert_eq!(paged_count(10, PageOptions::new(10, 5)), 0);
        assert_eq!(paged_count(10, PageOptions::new(0, 0)), 0);
        assert_eq!(paged_count(10, PageOptions { start: 3, size: None }), 7);
    }

    #[test]
    fn test_split_page_across_three_children() {
        let pages = split_page(&[4, 8, 20], PageOptions::new(10, 5));
        assert_eq!(
            pages,
            vec![PageOptions::new(0, 0), PageOptions::new(6, 2), PageOptions::new(0, 3)]
        );
        let read: usize = pages
            .iter()
            .zip([4, 8, 20])
            .map(|(page, count)| paged_count(count, *page))
            .sum();
        assert_eq!(read, 5);
    }

    #[test]
    fn test_split_unbounded_page() {
        let pages = split_page(&[2, 3], PageOptions { start: 3, size: None });
        assert_eq!(pages[0], PageOptions::new(0, 0));
        assert_eq!(pages[1], PageOptions { start: 1, size: None });
        assert_eq!(split_page(&[], PageOptions::new(0, 5)), Vec::<PageOptions>::new());
    }
}
