//! PubMed literature lookup over NCBI E-utilities.

use std::time::Duration;

use roxmltree::{Document, Node, ParsingOptions};
use serde::Serialize;
use thiserror::Error;

use crate::config::Settings;

pub const DEFAULT_MAX_RESULTS: u32 = 10;
pub const MAX_RESULTS_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("PubMed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("PubMed returned status {0}")]
    Status(u16),

    #[error("Unreadable PubMed response: {0}")]
    Xml(#[from] roxmltree::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Article {
    pub pmid: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub url: String,
}

#[derive(Clone)]
pub struct PubMedClient {
    client: reqwest::Client,
    base_url: String,
}

impl PubMedClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_seconds))
            .build()?;
        Ok(Self::new(client, &settings.pubmed_base_url))
    }

    /// esearch for ids, then efetch the abstracts.
    pub async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Article>, EvidenceError> {
        let retmax = max_results.clamp(1, MAX_RESULTS_LIMIT).to_string();
        let search_xml = self
            .get(
                "esearch.fcgi",
                &[("db", "pubmed"), ("term", query), ("retmax", retmax.as_str())],
            )
            .await?;

        let ids = parse_search_ids(&search_xml)?;
        if ids.is_empty() {
            tracing::info!("PubMed search returned no ids");
            return Ok(Vec::new());
        }

        let id_list = ids.join(",");
        let fetch_xml = self
            .get(
                "efetch.fcgi",
                &[
                    ("db", "pubmed"),
                    ("id", id_list.as_str()),
                    ("rettype", "abstract"),
                    ("retmode", "xml"),
                ],
            )
            .await?;

        let articles = parse_articles(&fetch_xml)?;
        tracing::info!(ids = ids.len(), articles = articles.len(), "PubMed search complete");
        Ok(articles)
    }

    async fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, EvidenceError> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, endpoint))
            .query(params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EvidenceError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }
}

// efetch responses carry a DOCTYPE declaration.
fn parse_xml(xml: &str) -> Result<Document<'_>, roxmltree::Error> {
    Document::parse_with_options(
        xml,
        ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        },
    )
}

fn descendants_named<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.descendants()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// All text below `node`, including inline markup such as `<i>`.
fn text_of(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn parse_search_ids(xml: &str) -> Result<Vec<String>, EvidenceError> {
    let doc = parse_xml(xml)?;
    let ids = descendants_named(doc.root_element(), "IdList")
        .flat_map(|list| descendants_named(list, "Id"))
        .map(text_of)
        .filter(|id| !id.is_empty())
        .collect();
    Ok(ids)
}

pub fn parse_articles(xml: &str) -> Result<Vec<Article>, EvidenceError> {
    let doc = parse_xml(xml)?;
    let mut articles = Vec::new();

    for article in descendants_named(doc.root_element(), "PubmedArticle") {
        let Some(pmid) = descendants_named(article, "PMID")
            .next()
            .map(text_of)
            .filter(|p| !p.is_empty())
        else {
            continue;
        };

        let title = descendants_named(article, "ArticleTitle")
            .next()
            .map(text_of)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "No title available".to_string());

        // Structured abstracts come as several labelled sections.
        let sections: Vec<String> = descendants_named(article, "AbstractText")
            .map(|section| {
                let text = text_of(section);
                match section.attribute("Label") {
                    Some(label) if !text.is_empty() => format!("{label}: {text}"),
                    _ => text,
                }
            })
            .filter(|s| !s.is_empty())
            .collect();
        let abstract_text = (!sections.is_empty()).then(|| sections.join("\n\n"));

        articles.push(Article {
            url: format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/"),
            pmid,
            title,
            abstract_text,
        });
    }
    Ok(articles)
}
