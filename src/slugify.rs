/// Normalize an uploaded filename into a safe, URL-friendly one.
///
/// Cyrillic is transliterated, spaces become hyphens, the name is lowercased
/// and stripped to letters, digits and single hyphens. The extension is kept
/// as given when it is purely alphanumeric. The result never contains a path
/// separator.
#[must_use]
pub fn filename(raw: &str) -> String {
    let transliterated = transliterate(raw.trim());
    let (name, ext) = split_extension(&transliterated);
    let name = name.replace(' ', "-").to_lowercase();

    let mut out = String::with_capacity(name.len() + ext.len() + 1);
    let mut hyphen_last = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            hyphen_last = false;
        } else if c == '-' && !hyphen_last {
            out.push(c);
            hyphen_last = true;
        }
    }

    if !ext.is_empty() {
        out.push('.');
        out.push_str(ext);
    }
    out
}

// Only a trailing run of alphanumerics counts as an extension, so separators
// after the last dot end up in the sanitized name part instead.
fn split_extension(s: &str) -> (&str, &str) {
    match s.rfind('.') {
        Some(idx) if s[idx + 1..].chars().all(char::is_alphanumeric) => (&s[..idx], &s[idx + 1..]),
        _ => (s, ""),
    }
}

fn transliterate(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match cyrillic(c) {
            Some(latin) => out.push_str(latin),
            None => out.push(c),
        }
    }
    out
}

const fn cyrillic(c: char) -> Option<&'static str> {
    Some(match c {
        'А' => "A",
        'Б' => "B",
        'В' => "V",
        'Г' => "G",
        'Д' => "D",
        'Е' | 'Э' => "E",
        'Ё' => "YO",
        'Ж' => "ZH",
        'З' => "Z",
        'И' => "I",
        'Й' | 'Ы' => "Y",
        'К' => "K",
        'Л' => "L",
        'М' => "M",
        'Н' => "N",
        'О' => "O",
        'П' => "P",
        'Р' => "R",
        'С' => "S",
        'Т' => "T",
        'У' => "U",
        'Ф' => "F",
        'Х' => "KH",
        'Ц' => "TS",
        'Ч' => "CH",
        'Ш' => "SH",
        'Щ' => "SHCH",
        'Ь' | 'ь' => "'",
        'Ъ' | 'ъ' => "",
        'Ю' => "YU",
        'Я' => "YA",
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' | 'э' => "e",
        'ё' => "yo",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' | 'ы' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "kh",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ю' => "yu",
        'я' => "ya",
        _ => return None,
    })
}
