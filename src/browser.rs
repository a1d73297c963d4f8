use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::walk::DashboardSession;

pub const DASHBOARD_URL: &str = "https://dashboard.microleapasia.com/";
pub const LIST_URL: &str = "https://dashboard.microleapasia.com/investment/me";

pub fn detail_url(id: &str) -> String {
    format!("{DASHBOARD_URL}investment/{id}")
}

/// Any URL that is not the login page counts as logged in. Login never gets
/// automated; the user authenticates in the opened window.
pub fn is_login_url(url: &str) -> bool {
    static LOGIN: OnceLock<Regex> = OnceLock::new();
    LOGIN
        .get_or_init(|| Regex::new(r"/login([?#]|$)").unwrap())
        .is_match(url)
}

/// Selects the largest option of the first page-size `<select>` so the list
/// page shows every investment in one listing.
const MAX_PAGE_SIZE_JS: &str = r#"
    (() => {
        const select = document.querySelector('select');
        if (!select || select.options.length === 0) return false;
        let max = select.options[0];
        for (const option of select.options) {
            if (parseInt(option.value) > parseInt(max.value)) max = option;
        }
        if (select.value === max.value) return false;
        select.value = max.value;
        select.dispatchEvent(new Event('change', { bubbles: true }));
        return true;
    })()
"#;

/// One Chrome window with a single tab navigating the dashboard, the way the
/// walk expects: full page navigations, never background fetches.
pub struct DashboardBrowser {
    browser: Browser,
    page: Page,
    settle: Duration,
    element_wait: Duration,
    http: reqwest::Client,
}

impl DashboardBrowser {
    pub async fn launch(headless: bool) -> Result<Self> {
        info!("Initializing browser");

        let mut config = BrowserConfig::builder();
        if !headless {
            config = config.with_head();
        }
        config = config.window_size(1920, 1080);
        config = config.viewport(None);

        let browser_config = config
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("failed to launch browser")?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    error!("browser handler error: {e:?}");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open a tab")?;

        Ok(Self {
            browser,
            page,
            settle: Duration::from_millis(500),
            element_wait: Duration::from_secs(5),
            http: reqwest::Client::new(),
        })
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("navigation to {url} failed"))?;
        self.page
            .wait_for_navigation()
            .await
            .with_context(|| format!("{url} never finished loading"))?;
        // Tables on this dashboard render client-side after the load event.
        sleep(self.settle).await;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String> {
        self.page
            .url()
            .await
            .context("failed to read page URL")?
            .ok_or_else(|| anyhow!("page has no URL yet"))
    }

    /// Poll until `selector` matches something, giving up after `deadline`.
    /// Returns whether the element appeared; the caller proceeds either way.
    pub async fn wait_for_element(&self, selector: &str, deadline: Duration) -> bool {
        let js = format!("document.querySelector({selector:?}) !== null");
        let started = Instant::now();
        loop {
            let found = match self.page.evaluate(js.as_str()).await {
                Ok(result) => result.into_value::<bool>().unwrap_or(false),
                Err(e) => {
                    warn!("element probe failed: {e:?}");
                    false
                }
            };
            if found {
                return true;
            }
            if started.elapsed() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    /// Best-effort: widen the list page's page-size control to its maximum.
    async fn widen_page_size(&self) -> Result<bool> {
        if !self.wait_for_element("select", self.element_wait).await {
            bail!("page size selector never appeared");
        }
        let changed = self
            .page
            .evaluate(MAX_PAGE_SIZE_JS)
            .await?
            .into_value::<bool>()?;
        if changed {
            // The list reloads with the new page size.
            sleep(self.settle).await;
        }
        Ok(changed)
    }

}

#[async_trait]
impl DashboardSession for DashboardBrowser {
    async fn open_dashboard(&mut self) -> Result<bool> {
        self.goto(DASHBOARD_URL).await?;
        let url = self.current_url().await?;
        Ok(!is_login_url(&url))
    }

    async fn is_logged_in(&mut self) -> Result<bool> {
        let url = self.current_url().await?;
        Ok(!is_login_url(&url))
    }

    async fn check_connection(&mut self) -> Result<bool> {
        match self
            .http
            .get(DASHBOARD_URL)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => Ok(!response.status().is_server_error()),
            Err(e) => {
                warn!("dashboard unreachable: {e}");
                Ok(false)
            }
        }
    }

    async fn open_list_page(&mut self) -> Result<String> {
        info!("Navigating to investment list page");
        self.goto(LIST_URL).await?;
        match self.widen_page_size().await {
            Ok(true) => info!("page size set to maximum"),
            Ok(false) => {}
            // Not critical, the default page size still lists investments.
            Err(e) => warn!("could not set page size: {e:#}"),
        }
        self.wait_for_element("table tbody tr", self.element_wait)
            .await;
        self.page
            .content()
            .await
            .context("failed to capture list page HTML")
    }

    async fn open_detail_page(&mut self, id: &str) -> Result<String> {
        let url = detail_url(id);
        info!("Navigating to {url}");
        self.goto(&url).await?;
        self.wait_for_element("table", self.element_wait).await;
        self.page
            .content()
            .await
            .context("failed to capture detail page HTML")
    }

    async fn close(&mut self) -> Result<()> {
        self.browser.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_urls_are_recognized() {
        assert!(is_login_url("https://dashboard.microleapasia.com/login"));
        assert!(is_login_url("https://dashboard.microleapasia.com/login?next=/investment/me"));
        assert!(is_login_url("https://dashboard.microleapasia.com/login#top"));
        assert!(!is_login_url("https://dashboard.microleapasia.com/"));
        assert!(!is_login_url("https://dashboard.microleapasia.com/investment/me"));
        assert!(!is_login_url("https://dashboard.microleapasia.com/login-help"));
    }

    #[test]
    fn detail_urls_follow_the_site_layout() {
        assert_eq!(
            detail_url("ML-0001"),
            "https://dashboard.microleapasia.com/investment/ML-0001"
        );
    }
}
