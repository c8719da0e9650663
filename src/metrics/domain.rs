/// Reduces a queried name to its registrable domain, the public suffix plus
/// one label, lower cased and without the trailing dot.
///
/// `www.shop.example.co.uk.` becomes `example.co.uk`. Names with no label
/// left above their public suffix are returned as they are; the root
/// becomes `.`.
pub fn registrable_domain(qname: &str) -> String {
    let name = qname.trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        return ".".to_string();
    }

    match psl::domain_str(&name) {
        Some(domain) => domain.to_string(),
        None => name,
    }
}
