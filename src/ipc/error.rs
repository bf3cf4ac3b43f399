use serde_json::json;

use crate::error::ServiceError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn fail(id: &str, e: &ServiceError) -> serde_json::Value {
    let mut resp = err(id, e.code(), e.to_string(), e.details());
    resp["error"]["status"] = json!(e.status());
    resp
}

pub fn respond(id: &str, result: Result<serde_json::Value, ServiceError>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => fail(id, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldError;

    #[test]
    fn service_errors_carry_code_status_and_details() {
        let resp = fail(
            "7",
            &ServiceError::invalid(vec![FieldError::new("grade", "required")]),
        );
        assert_eq!(resp["id"], "7");
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["code"], "bad_params");
        assert_eq!(resp["error"]["status"], 400);
        assert_eq!(resp["error"]["details"]["errors"][0]["field"], "grade");

        let resp = respond("8", Err(ServiceError::not_found("no grade data")));
        assert_eq!(resp["error"]["message"], "no grade data");
        assert!(resp["error"].get("details").is_none());
    }
}
