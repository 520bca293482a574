// src/main.rs

use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::error::Error;

#[derive(Debug, Deserialize)]
struct PayMonthSummary {
    month_year: String,
    #[serde(default)]
    status: Option<String>,
}

/// Unwraps `{"data": ...}` envelopes; bare payloads pass through.
fn payload(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

struct Smoke {
    client: Client,
    base_url: String,
    headers: header::HeaderMap,
    passed: usize,
    failed: usize,
}

impl Smoke {
    async fn check(&mut self, label: &str, path: &str) -> Option<Value> {
        println!("\n🔍 {} (GET {})", label, path);
        let result = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .headers(self.headers.clone())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                println!("❌ request failed: {}", e);
                self.failed += 1;
                return None;
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status != StatusCode::OK {
            println!("❌ status {}: {}", status, text);
            self.failed += 1;
            return None;
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(body) => {
                println!("✅ status {}", status);
                self.passed += 1;
                Some(payload(body))
            }
            Err(e) => {
                println!("❌ body is not JSON: {}", e);
                self.failed += 1;
                None
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let base_url = env::var("PAYROLL_API_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:8000/api".to_string())
        .trim_end_matches('/')
        .to_string();

    let mut headers = header::HeaderMap::new();
    headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    if let Ok(token) = env::var("PAYROLL_API_TOKEN") {
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
    }

    let mut smoke = Smoke {
        client: Client::new(),
        base_url,
        headers,
        passed: 0,
        failed: 0,
    };
    println!("Smoke testing payroll backend at {}", smoke.base_url);

    let months = smoke.check("Pay months", "/payroll/pay-months").await;
    let latest = months
        .and_then(|v| serde_json::from_value::<Vec<PayMonthSummary>>(v).ok())
        .and_then(|months| months.into_iter().max_by(|a, b| a.month_year.cmp(&b.month_year)));

    match latest {
        Some(month) => {
            println!(
                "Latest month: {} ({})",
                month.month_year,
                month.status.as_deref().unwrap_or("unknown")
            );
            smoke
                .check("Pay month detail", &format!("/payroll/pay-months/{}", month.month_year))
                .await;
            if let Some(payments) = smoke
                .check("Payments for month", &format!("/payroll/payments/{}", month.month_year))
                .await
            {
                let count = payments.as_array().map_or(0, Vec::len);
                println!("Payments returned: {}", count);
            }
        }
        None => println!("\n⚠️ No pay months found; skipping month detail checks"),
    }

    if let Some(employees) = smoke.check("Employees", "/payroll/employees").await {
        let list = employees.as_array().cloned().unwrap_or_default();
        let configured = list
            .iter()
            .filter(|e| e.get("has_salary_config").and_then(Value::as_bool) == Some(true))
            .count();
        println!("Employees: {} ({} with salary config)", list.len(), configured);

        if let Some(id) = list.first().and_then(|e| e.get("id")) {
            let id = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            smoke
                .check("Salary config", &format!("/payroll/config/{}", id))
                .await;
        }
    }

    smoke.check("Payment history", "/payroll/history").await;

    println!("\nSmoke test results:");
    println!("  Passed: {}", smoke.passed);
    println!("  Failed: {}", smoke.failed);

    if smoke.failed > 0 {
        std::process::exit(1);
    }
    println!("\n✅ Testing complete!");
    Ok(())
}
