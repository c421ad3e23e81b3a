/// `;key=value;flag` 形式のパラメータ列を分解する。値なしのフラグは空文字列になる。
pub fn parse_params(input: &str) -> Vec<(String, String)> {
    input
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|p| {
            let mut iter = p.splitn(2, '=');
            let k = iter.next()?.trim();
            let v = iter.next().unwrap_or("").trim();
            Some((k.to_string(), v.trim_matches('"').to_string()))
        })
        .collect()
}
