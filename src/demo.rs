//! Packaged demo spider
//!
//! Crawls a product-catalog style site: navigation and product-list
//! links are followed, about/sale sections are avoided, and product
//! blocks turn into [`ProductItem`] records. Registered under `demo`
//! and used by the integration tests as a realistic spider.

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::error::BoxError;
use crate::models::{Item, Response, Task};
use crate::spider::{Spider, SpiderUrls};

/// One extracted product record.
#[derive(Debug, Clone)]
pub struct ProductItem {
    pub iid: u64,
    pub url: String,
    pub name: String,
    pub category: String,
    pub desc: String,
    pub price: f64,
    pub images: Vec<String>,
}

impl Item for ProductItem {
    fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("iid".to_string(), self.iid.into());
        map.insert("url".to_string(), self.url.clone().into());
        map.insert("name".to_string(), self.name.clone().into());
        map.insert("category".to_string(), self.category.clone().into());
        map.insert("desc".to_string(), self.desc.clone().into());
        map.insert("price".to_string(), self.price.into());
        map.insert("images".to_string(), self.images.clone().into());
        map
    }
}

/// Demo spider for a product-catalog site.
pub struct DemoSpider {
    urls: SpiderUrls,
}

impl DemoSpider {
    pub fn new() -> Self {
        Self {
            urls: SpiderUrls {
                start: vec!["http://localhost:8000/".to_string()],
                allow: vec![
                    "nav a".to_string(),
                    "#product-list a".to_string(),
                ],
                avoid: vec![
                    r#"a[href*="/about/"]"#.to_string(),
                    r#"a[href*="/sale/"]"#.to_string(),
                ],
            },
        }
    }

    /// Spider with custom seed URLs, keeping the demo link rules.
    pub fn with_start_urls(start: Vec<String>) -> Self {
        let mut spider = Self::new();
        spider.urls.start = start;
        spider
    }
}

impl Default for DemoSpider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spider for DemoSpider {
    fn name(&self) -> &str {
        "demo"
    }

    fn urls(&self) -> &SpiderUrls {
        &self.urls
    }

    async fn items(
        &self,
        _task: &Task,
        response: &Response,
    ) -> Result<Vec<Box<dyn Item>>, BoxError> {
        extract_products(response)
    }
}

/// Parse product blocks out of a page. Synchronous so the parsed
/// document never crosses an await point.
fn extract_products(response: &Response) -> Result<Vec<Box<dyn Item>>, BoxError> {
    let document = Html::parse_document(&response.text);
    let product = Selector::parse("div.product").expect("static selector");
    let name = Selector::parse("h2").expect("static selector");
    let desc = Selector::parse("p").expect("static selector");
    let category = Selector::parse("span").expect("static selector");
    let price = Selector::parse("em").expect("static selector");
    let image = Selector::parse("img").expect("static selector");

    let mut items: Vec<Box<dyn Item>> = Vec::new();
    for block in document.select(&product) {
        let iid: u64 = block
            .value()
            .attr("product-id")
            .ok_or("product block without product-id")?
            .parse()?;
        let text_of = |selector: &Selector| -> Result<String, BoxError> {
            Ok(block
                .select(selector)
                .next()
                .ok_or("incomplete product block")?
                .text()
                .collect::<String>()
                .trim()
                .to_string())
        };

        items.push(Box::new(ProductItem {
            iid,
            url: response.url.clone(),
            name: text_of(&name)?,
            category: text_of(&category)?,
            desc: text_of(&desc)?,
            price: text_of(&price)?.parse()?,
            images: block
                .select(&image)
                .filter_map(|img| img.value().attr("src"))
                .map(str::to_string)
                .collect(),
        }));
    }
    Ok(items)
}
