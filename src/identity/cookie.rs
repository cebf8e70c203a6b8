//! Cookie 罐合并

/// 从 Set-Cookie 头解析出的单个 Cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    /// `name=value` 形式
    pub pair: String,
    /// Max-Age <= 0 表示服务端要求删除该 Cookie
    pub expired: bool,
}

/// 解析 Set-Cookie 值；没有合法名称时返回 None
pub fn parse_set_cookie(raw: &str) -> Option<SetCookie> {
    let mut parts = raw.split(';');
    let pair = parts.next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let expired = parts.any(|attr| {
        let (key, value) = attr.split_once('=').unwrap_or((attr, ""));
        key.trim().eq_ignore_ascii_case("max-age")
            && value.trim().parse::<i64>().is_ok_and(|age| age <= 0)
    });

    Some(SetCookie {
        name: name.to_string(),
        pair: format!("{}={}", name, value.trim()),
        expired,
    })
}

/// `name=value` 中的名称部分
pub fn cookie_name(pair: &str) -> &str {
    pair.split_once('=').map(|(n, _)| n).unwrap_or(pair).trim()
}

/// 将 Set-Cookie 值合并进 Cookie 罐
///
/// 同名 Cookie 原位覆盖（后写者胜），新名称追加到末尾，未出现的 Cookie 保留
pub fn merge(jar: &mut Vec<String>, set_cookies: &[String]) {
    for cookie in set_cookies.iter().filter_map(|raw| parse_set_cookie(raw)) {
        let existing = jar.iter().position(|c| cookie_name(c) == cookie.name);
        match (existing, cookie.expired) {
            (Some(idx), true) => {
                jar.remove(idx);
            }
            (Some(idx), false) => jar[idx] = cookie.pair,
            (None, false) => jar.push(cookie.pair),
            (None, true) => {}
        }
    }
}

/// 生成 Cookie 请求头；罐为空时返回 None
pub fn cookie_header(jar: &[String]) -> Option<String> {
    if jar.is_empty() {
        None
    } else {
        Some(jar.join("; "))
    }
}
