// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Space/tab tokenizer with double-quoted substrings, shared by the
//! config-file parser and the certificate pin database.

/// Split `s` on runs of spaces and tabs. A token starting with `"` runs
/// to the closing quote (or end of line) and may contain whitespace.
/// After `max_splits` tokens have been produced, the rest of the line is
/// returned as one final token, quotes and inner whitespace intact.
/// `max_splits == 0` means unlimited.
pub fn tokenize(s: &str, max_splits: usize) -> Vec<String> {
    let mut ret = Vec::new();
    let mut rest = s;

    loop {
        let start = match rest.find(|c| c != ' ' && c != '\t') {
            Some(i) => i,
            None => return ret,
        };
        rest = &rest[start..];

        if max_splits != 0 && ret.len() == max_splits {
            ret.push(trim_quotes(rest.trim_end_matches([' ', '\t'])));
            return ret;
        }

        if let Some(inner) = rest.strip_prefix('"') {
            match inner.find('"') {
                Some(end) => {
                    ret.push(String::from(&inner[..end]));
                    rest = &inner[end + 1..];
                }
                None => {
                    // unterminated quote: take the rest of the line
                    ret.push(String::from(inner.trim_end_matches([' ', '\t'])));
                    return ret;
                }
            }
        } else {
            match rest.find([' ', '\t']) {
                Some(end) => {
                    ret.push(String::from(&rest[..end]));
                    rest = &rest[end..];
                }
                None => {
                    ret.push(String::from(rest));
                    return ret;
                }
            }
        }
    }
}

fn trim_quotes(s: &str) -> String {
    String::from(s.trim_matches('"'))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_words() {
        assert_eq!(tokenize("a b  c", 0), vec!["a", "b", "c"]);
        assert_eq!(tokenize("  \t a\t", 0), vec!["a"]);
        assert!(tokenize("", 0).is_empty());
        assert!(tokenize(" \t ", 0).is_empty());
    }

    #[test]
    fn quoted_substrings() {
        assert_eq!(tokenize(r#"Chroot "/var/empty dir""#, 0), vec!["Chroot", "/var/empty dir"]);
        assert_eq!(tokenize(r#""a b" c"#, 0), vec!["a b", "c"]);
        // unterminated quote runs to end of line
        assert_eq!(tokenize(r#"x "y z"#, 0), vec!["x", "y z"]);
    }

    #[test]
    fn max_splits_caps_the_token_count() {
        assert_eq!(tokenize("Port 12345 trailing junk", 1), vec!["Port", "12345 trailing junk"]);
        assert_eq!(tokenize("a b c d", 2), vec!["a", "b", "c d"]);
        // the capped tail keeps inner whitespace but loses outer quotes
        assert_eq!(tokenize(r#"Key "v w""#, 1), vec!["Key", "v w"]);
    }
}
