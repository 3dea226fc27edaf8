use crate::snapshot::SchemaPayload;

/// Heuristic question classes the schema can plausibly answer, joined as
/// a compact string for planner context. Hints only; never used to
/// authorize anything.
pub fn profile(payload: &SchemaPayload) -> String {
    let entities = payload.entities();
    if entities.is_empty() {
        return String::new();
    }

    let mut capabilities: Vec<&str> = vec!["record_counts"];

    let mut has_price = false;
    let mut has_quantity = false;
    let mut has_date = false;
    let mut has_user_handle = false;
    let mut has_status = false;
    let mut has_product_ref = false;

    for entity in &entities {
        for field in &entity.fields {
            let lower = field.to_lowercase();
            if lower.contains("price") || lower.contains("amount") || lower.contains("total") {
                has_price = true;
            }
            if lower.contains("quantity") || lower.contains("qty") {
                has_quantity = true;
            }
            if lower.contains("date") || lower.contains("created") || lower.contains("timestamp") {
                has_date = true;
            }
            if lower.contains("email") || lower.contains("username") {
                has_user_handle = true;
            }
            if lower == "status" || lower.ends_with("_status") {
                has_status = true;
            }
            if lower.contains("product") {
                has_product_ref = true;
            }
        }
    }

    if has_price && (has_quantity || has_product_ref) {
        capabilities.push("top_selling_products");
    }
    if has_price && has_date {
        capabilities.push("revenue_over_time");
    }
    if has_date {
        capabilities.push("activity_over_time");
    }
    if has_user_handle {
        capabilities.push("user_lookup");
    }
    if has_status {
        capabilities.push("status_breakdown");
    }

    capabilities.join(", ")
}
