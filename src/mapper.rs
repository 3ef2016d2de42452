use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::db::SentOrderRepo;
use crate::odoo::{OdooClient, OdooResult};

const SALE_ORDER_FIELDS: &[&str] = &[
    "id",
    "name",
    "partner_id",
    "order_line",
    "amount_total",
    "currency_id",
    "write_date",
];
const PARTNER_FIELDS: &[&str] = &["id", "name", "email", "vat"];
const ORDER_LINE_FIELDS: &[&str] = &["id", "product_id", "product_uom_qty", "price_unit", "price_subtotal"];
const PRODUCT_FIELDS: &[&str] = &["id", "default_code", "barcode", "product_tmpl_id", "name"];
const TEMPLATE_FIELDS: &[&str] = &["id", "default_code", "barcode"];

/// Result of one mapping pass: normalized webhook payloads (in the order
/// Odoo returned them) plus the raw found-count before any filtering, and
/// a count of orders dropped because their related records didn't parse
/// (`MappingError`, per order — the cycle continues regardless).
pub struct MapResult {
    pub payloads: Vec<Value>,
    pub found_count: usize,
    pub mapping_errors: usize,
}

/// `search_read` confirmed orders since `since`, drop ones already
/// delivered, batch-fetch partners/lines/products/templates, and build one
/// normalized payload per surviving order. Never issues a per-order read:
/// every related-entity fetch is a single batched call over the full id set
/// collected from this cycle's orders.
pub async fn map_connection_orders(
    client: &OdooClient,
    connection_id: i64,
    db_name: &str,
    since: Option<DateTime<Utc>>,
    sent_orders: &SentOrderRepo,
) -> OdooResult<MapResult> {
    let domain = match since {
        Some(since) => serde_json::json!([
            ["state", "in", ["sale", "done"]],
            ["write_date", ">", since.format("%Y-%m-%d %H:%M:%S").to_string()],
        ]),
        None => serde_json::json!([["state", "in", ["sale", "done"]]]),
    };

    let orders = client
        .search_read("sale.order", domain, SALE_ORDER_FIELDS, None, Some("write_date asc"))
        .await?;
    let found_count = orders.len();

    let mut surviving = Vec::with_capacity(orders.len());
    for order in orders {
        let (Some(id), Some(write_date)) = (order_id(&order), order.get("write_date").and_then(Value::as_str))
        else {
            continue;
        };
        match sent_orders.exists(connection_id, id, write_date).await {
            Ok(true) => continue,
            Ok(false) => surviving.push(order),
            Err(e) => {
                warn!(connection_id, order_id = id, error = %e, "dedup check failed, treating order as new");
                surviving.push(order);
            }
        }
    }

    if surviving.is_empty() {
        return Ok(MapResult {
            payloads: Vec::new(),
            found_count,
            mapping_errors: 0,
        });
    }

    let partner_ids = distinct_i64_refs(&surviving, "partner_id");
    let line_ids = distinct_line_ids(&surviving);

    let partners = client.read("res.partner", &partner_ids, PARTNER_FIELDS).await?;
    let lines = client.read("sale.order.line", &line_ids, ORDER_LINE_FIELDS).await?;

    let product_ids = distinct_i64_refs(&lines, "product_id");
    let products = client.read("product.product", &product_ids, PRODUCT_FIELDS).await?;

    let template_ids = distinct_i64_refs(&products, "product_tmpl_id");
    let templates = client.read("product.template", &template_ids, TEMPLATE_FIELDS).await?;

    let partners_by_id = index_by_id(&partners);
    let lines_by_id = index_by_id(&lines);
    let products_by_id = index_by_id(&products);
    let templates_by_id = index_by_id(&templates);

    let mut payloads = Vec::with_capacity(surviving.len());
    let mut mapping_errors = 0;
    for order in &surviving {
        match build_payload(
            order,
            connection_id,
            db_name,
            &partners_by_id,
            &lines_by_id,
            &products_by_id,
            &templates_by_id,
        ) {
            Some(payload) => payloads.push(payload),
            None => {
                mapping_errors += 1;
                warn!(connection_id, order = %order, "skipping order with unexpected shape");
            }
        }
    }

    Ok(MapResult {
        payloads,
        found_count,
        mapping_errors,
    })
}

fn order_id(order: &Value) -> Option<i64> {
    order.get("id").and_then(Value::as_i64)
}

/// m2o fields come back from Odoo as either `false` or `[id, display_name]`.
fn m2o_id(value: &Value) -> Option<i64> {
    value.as_array().and_then(|pair| pair.first()).and_then(Value::as_i64)
}

fn distinct_i64_refs(records: &[Value], field: &str) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for record in records {
        if let Some(id) = record.get(field).and_then(m2o_id) {
            if seen.insert(id) {
                ids.push(id);
            }
        }
    }
    ids
}

fn distinct_line_ids(orders: &[Value]) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for order in orders {
        let Some(lines) = order.get("order_line").and_then(Value::as_array) else {
            continue;
        };
        for line in lines {
            if let Some(id) = line.as_i64()
                && seen.insert(id)
            {
                ids.push(id);
            }
        }
    }
    ids
}

fn index_by_id(records: &[Value]) -> HashMap<i64, &Value> {
    records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64).map(|id| (id, r)))
        .collect()
}

/// First non-empty value wins: product `default_code`, product `barcode`,
/// template `default_code`, template `barcode`, else a synthetic id-based
/// SKU so every line still has one.
fn resolve_sku(db_name: &str, product: Option<&Value>, template: Option<&Value>, product_id: i64) -> String {
    let candidates = [
        product.and_then(|p| p.get("default_code")).and_then(non_empty_str),
        product.and_then(|p| p.get("barcode")).and_then(non_empty_str),
        template.and_then(|t| t.get("default_code")).and_then(non_empty_str),
        template.and_then(|t| t.get("barcode")).and_then(non_empty_str),
    ];
    candidates
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_else(|| format!("ODOO-{db_name}-{product_id}"))
}

fn non_empty_str(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

fn build_payload(
    order: &Value,
    connection_id: i64,
    db_name: &str,
    partners_by_id: &HashMap<i64, &Value>,
    lines_by_id: &HashMap<i64, &Value>,
    products_by_id: &HashMap<i64, &Value>,
    templates_by_id: &HashMap<i64, &Value>,
) -> Option<Value> {
    let order_id = order.get("id").and_then(Value::as_i64)?;
    let order_name = order.get("name").and_then(Value::as_str)?.to_string();
    let write_date = order.get("write_date").and_then(Value::as_str)?.to_string();
    let currency_id = m2o_id(order.get("currency_id")?);
    let amount_total = order.get("amount_total")?.clone();

    let partner_id = m2o_id(order.get("partner_id")?)?;
    let partner = partners_by_id.get(&partner_id)?;

    let line_ids: Vec<i64> = order
        .get("order_line")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_i64)
        .collect();

    let mut lines = Vec::new();
    for line_id in line_ids {
        let Some(line) = lines_by_id.get(&line_id) else {
            continue;
        };
        let quantity = line.get("product_uom_qty").and_then(Value::as_f64).unwrap_or(0.0);
        if quantity == 0.0 {
            continue;
        }

        let product_id = line.get("product_id").and_then(m2o_id);
        let product = product_id.and_then(|id| products_by_id.get(&id).copied());
        let template = product
            .and_then(|p| p.get("product_tmpl_id"))
            .and_then(m2o_id)
            .and_then(|id| templates_by_id.get(&id).copied());

        let sku = resolve_sku(db_name, product, template, product_id.unwrap_or_default());
        let product_name = product
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        lines.push(serde_json::json!({
            "sku": sku,
            "product_name": product_name,
            "quantity": quantity,
            "unit_price": line.get("price_unit").cloned().unwrap_or(Value::Null),
            "subtotal": line.get("price_subtotal").cloned().unwrap_or(Value::Null),
        }));
    }

    Some(serde_json::json!({
        "connection_id": connection_id,
        "order_id": order_id,
        "order_name": order_name,
        "write_date": write_date,
        "partner": {
            "id": partner_id,
            "name": partner.get("name").and_then(Value::as_str).unwrap_or(""),
            "email": partner.get("email").and_then(Value::as_str),
            "vat": partner.get("vat").and_then(Value::as_str),
        },
        "currency": currency_id,
        "amount_total": amount_total,
        "lines": lines,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_sku_prefers_product_default_code() {
        let product = json!({"default_code": "WIDGET-1", "barcode": "12345"});
        let template = json!({"default_code": "TMPL-1", "barcode": "67890"});
        assert_eq!(resolve_sku("db", Some(&product), Some(&template), 7), "WIDGET-1");
    }

    #[test]
    fn test_resolve_sku_falls_back_to_product_barcode() {
        let product = json!({"default_code": "", "barcode": "12345"});
        assert_eq!(resolve_sku("db", Some(&product), None, 7), "12345");
    }

    #[test]
    fn test_resolve_sku_falls_back_to_template() {
        let product = json!({"default_code": "", "barcode": ""});
        let template = json!({"default_code": "TMPL-1", "barcode": ""});
        assert_eq!(resolve_sku("db", Some(&product), Some(&template), 7), "TMPL-1");
    }

    #[test]
    fn test_resolve_sku_synthesizes_when_all_empty() {
        assert_eq!(resolve_sku("acme_db", None, None, 99), "ODOO-acme_db-99");
    }

    #[test]
    fn test_m2o_id_extracts_leading_id() {
        assert_eq!(m2o_id(&json!([5, "Partner Five"])), Some(5));
        assert_eq!(m2o_id(&json!(false)), None);
    }

    #[test]
    fn test_distinct_i64_refs_dedups_preserving_first_seen_order() {
        let records = vec![
            json!({"partner_id": [2, "B"]}),
            json!({"partner_id": [1, "A"]}),
            json!({"partner_id": [2, "B"]}),
        ];
        assert_eq!(distinct_i64_refs(&records, "partner_id"), vec![2, 1]);
    }

    #[test]
    fn test_build_payload_omits_zero_quantity_lines() {
        let order = json!({
            "id": 10, "name": "SO010", "write_date": "2026-01-01 00:00:00",
            "partner_id": [1, "Acme"], "currency_id": [2, "USD"], "amount_total": 100.0,
            "order_line": [100, 101],
        });
        let mut partners = HashMap::new();
        let partner = json!({"id": 1, "name": "Acme", "email": "a@acme.test", "vat": null});
        partners.insert(1, &partner);

        let mut lines = HashMap::new();
        let zero_line = json!({"id": 100, "product_id": false, "product_uom_qty": 0.0, "price_unit": 10.0, "price_subtotal": 0.0});
        let nonzero_line = json!({"id": 101, "product_id": false, "product_uom_qty": 2.0, "price_unit": 10.0, "price_subtotal": 20.0});
        lines.insert(100, &zero_line);
        lines.insert(101, &nonzero_line);

        let products = HashMap::new();
        let templates = HashMap::new();

        let payload = build_payload(&order, 1, "db", &partners, &lines, &products, &templates).unwrap();
        let lines_out = payload["lines"].as_array().unwrap();
        assert_eq!(lines_out.len(), 1);
        assert_eq!(lines_out[0]["quantity"], 2.0);
    }

    #[test]
    fn test_build_payload_missing_partner_returns_none() {
        let order = json!({
            "id": 10, "name": "SO010", "write_date": "2026-01-01 00:00:00",
            "partner_id": [1, "Acme"], "currency_id": [2, "USD"], "amount_total": 100.0,
            "order_line": [],
        });
        let partners = HashMap::new();
        let lines = HashMap::new();
        let products = HashMap::new();
        let templates = HashMap::new();
        assert!(build_payload(&order, 1, "db", &partners, &lines, &products, &templates).is_none());
    }
}
