pub fn openapi() -> utoipa::openapi::OpenApi {
    lexiclip_http::openapi::openapi()
}

pub fn write_openapi_json() -> std::io::Result<std::path::PathBuf> {
    let doc = openapi();
    let json = serde_json::to_string_pretty(&doc)
        .map_err(|e| std::io::Error::other(format!("serialize openapi: {e}")))?;

    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("openapi.gen.json");
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    #[test]
    fn gen_openapi_json() {
        super::write_openapi_json().unwrap();
    }
}
