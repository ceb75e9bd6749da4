/*!
Html pages, rendered with tera. Templates are compiled into the binary
and autoescaped since their names end in `.html`.
*/
use std::sync::Arc;
use tera::Tera;

use crate::Result;

const INDEX: &str = "index.html";
const DASHBOARD: &str = "dashboard.html";

#[derive(Clone)]
pub struct Pages {
    tera: Arc<Tera>,
}

impl Pages {
    pub fn new() -> anyhow::Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (INDEX, include_str!("../templates/index.html")),
            (DASHBOARD, include_str!("../templates/dashboard.html")),
        ])?;
        Ok(Self {
            tera: Arc::new(tera),
        })
    }

    fn render(&self, name: &str, ctx: &tera::Context) -> Result<String> {
        self.tera
            .render(name, ctx)
            .map_err(|e| se!("error rendering {}: {}", name, e))
    }

    pub fn index(&self) -> Result<String> {
        self.render(INDEX, &tera::Context::new())
    }

    pub fn dashboard(&self, display_name: &str) -> Result<String> {
        let mut ctx = tera::Context::new();
        ctx.insert("display_name", display_name);
        self.render(DASHBOARD, &ctx)
    }
}
