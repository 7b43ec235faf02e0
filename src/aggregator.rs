use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// One resolved source feeding a session's cache content, tagged with its
/// provenance paper id (backs the `paper_references` join table).
#[derive(Debug, Clone)]
pub struct AggregatedPaper {
    pub paper_id: String,
    pub title: Option<String>,
    pub text: String,
}

/// Resolves an arXiv id to abstract/full text. Real arXiv downloading is
/// out of scope; this trait is the injectable seam so the core never
/// depends on a concrete downloader.
#[async_trait]
pub trait ArxivResolver: Send + Sync {
    async fn resolve(&self, arxiv_id: &str) -> Result<AggregatedPaper>;
}

/// Extracts text from an uploaded PDF's raw bytes. Real PDF text
/// extraction is out of scope; this trait is the injectable seam.
#[async_trait]
pub trait PdfExtractor: Send + Sync {
    async fn extract(&self, paper_id: &str, bytes: &[u8]) -> Result<AggregatedPaper>;
}

/// Concatenates resolved arXiv papers and extracted uploads into the single
/// textual context handed to the Cache Manager for cache creation.
pub struct ContentAggregator {
    arxiv: Arc<dyn ArxivResolver>,
    pdf: Arc<dyn PdfExtractor>,
}

impl ContentAggregator {
    pub fn new(arxiv: Arc<dyn ArxivResolver>, pdf: Arc<dyn PdfExtractor>) -> Self {
        Self { arxiv, pdf }
    }

    /// Resolves every source in order and joins them into one document,
    /// separated so provenance boundaries stay visually obvious to the
    /// model. Returns the joined text alongside each source's record, the
    /// latter destined for `paper_references`.
    pub async fn aggregate(
        &self,
        arxiv_ids: &[String],
        uploads: &[(String, Vec<u8>)],
    ) -> Result<(String, Vec<AggregatedPaper>)> {
        let mut papers = Vec::with_capacity(arxiv_ids.len() + uploads.len());

        for id in arxiv_ids {
            papers.push(self.arxiv.resolve(id).await?);
        }
        for (paper_id, bytes) in uploads {
            papers.push(self.pdf.extract(paper_id, bytes).await?);
        }

        let combined = papers
            .iter()
            .map(|p| format!("# {}\n\n{}", p.title.as_deref().unwrap_or(&p.paper_id), p.text))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        Ok((combined, papers))
    }
}

/// Placeholder resolver: arXiv downloading proper is out of scope, so this
/// returns a clearly-marked stand-in abstract rather than calling out to
/// the network.
pub struct StubArxivResolver;

#[async_trait]
impl ArxivResolver for StubArxivResolver {
    async fn resolve(&self, arxiv_id: &str) -> Result<AggregatedPaper> {
        Ok(AggregatedPaper {
            paper_id: arxiv_id.to_string(),
            title: None,
            text: format!("[stub abstract for arXiv:{arxiv_id} — full aggregation is out of scope]"),
        })
    }
}

/// Placeholder extractor: PDF text extraction proper is out of scope, so
/// this only lossily decodes whatever bytes were uploaded.
pub struct StubPdfExtractor;

#[async_trait]
impl PdfExtractor for StubPdfExtractor {
    async fn extract(&self, paper_id: &str, bytes: &[u8]) -> Result<AggregatedPaper> {
        Ok(AggregatedPaper {
            paper_id: paper_id.to_string(),
            title: None,
            text: String::from_utf8_lossy(bytes).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregate_joins_arxiv_and_uploads_in_order() {
        let agg = ContentAggregator::new(Arc::new(StubArxivResolver), Arc::new(StubPdfExtractor));
        let (combined, papers) = agg
            .aggregate(&["2401.00001".to_string()], &[("upload-1".to_string(), b"hello world".to_vec())])
            .await
            .unwrap();

        assert_eq!(papers.len(), 2);
        assert!(combined.contains("2401.00001"));
        assert!(combined.contains("hello world"));
    }
}
