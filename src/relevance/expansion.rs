use std::collections::BTreeSet;

use super::text::significant_tokens;

/// Keyword token → concept words a label detector tends to return for
/// photos of that kind of product.
const EXPANSIONS: &[(&str, &[&str])] = &[
    ("blanket", &["blanket", "throw", "bedding", "textile", "linen", "quilt", "duvet", "comforter", "fleece", "wool"]),
    ("throw", &["blanket", "textile", "bedding", "cushion"]),
    ("sherpa", &["fleece", "fur", "wool", "textile", "plush"]),
    ("fleece", &["textile", "wool", "fur", "blanket"]),
    ("pillow", &["pillow", "cushion", "bedding", "textile", "throw pillow"]),
    ("towel", &["towel", "textile", "linen", "bath"]),
    ("rug", &["rug", "carpet", "flooring", "mat", "textile"]),
    ("mat", &["mat", "rug", "flooring"]),
    ("curtain", &["curtain", "window treatment", "textile", "drapery"]),
    ("mug", &["mug", "cup", "drinkware", "tableware", "ceramic", "coffee cup"]),
    ("cup", &["cup", "mug", "drinkware", "tableware"]),
    ("bottle", &["bottle", "water bottle", "drinkware", "flask"]),
    ("lamp", &["lamp", "lighting", "light fixture", "lampshade"]),
    ("light", &["lighting", "lamp", "light fixture", "bulb"]),
    ("candle", &["candle", "wax", "candle holder"]),
    ("vase", &["vase", "flowerpot", "ceramic", "glass"]),
    ("chair", &["chair", "furniture", "seat"]),
    ("table", &["table", "furniture", "desk"]),
    ("shelf", &["shelf", "shelving", "furniture", "bookcase"]),
    ("bag", &["bag", "handbag", "tote bag", "backpack", "luggage"]),
    ("backpack", &["backpack", "bag", "luggage"]),
    ("wallet", &["wallet", "leather", "purse"]),
    ("shirt", &["shirt", "t-shirt", "clothing", "sleeve", "top"]),
    ("hoodie", &["hoodie", "sweatshirt", "clothing", "sleeve", "outerwear"]),
    ("jacket", &["jacket", "coat", "outerwear", "clothing"]),
    ("dress", &["dress", "clothing", "gown"]),
    ("shoe", &["shoe", "footwear", "sneaker", "boot"]),
    ("sneaker", &["sneaker", "shoe", "footwear"]),
    ("sock", &["sock", "hosiery", "clothing"]),
    ("hat", &["hat", "cap", "headgear", "beanie"]),
    ("watch", &["watch", "clock", "wristwatch", "jewellery"]),
    ("ring", &["ring", "jewellery", "jewelry"]),
    ("headphone", &["headphones", "headset", "audio equipment", "gadget"]),
    ("speaker", &["loudspeaker", "speaker", "audio equipment", "gadget"]),
    ("plant", &["plant", "houseplant", "flowerpot", "leaf"]),
    ("planter", &["flowerpot", "plant", "pot"]),
    ("dog", &["dog", "pet supply", "canine", "puppy", "dog bed"]),
    ("cat", &["cat", "pet supply", "kitten", "feline"]),
    ("bed", &["bed", "bedding", "furniture", "mattress", "pet bed"]),
    ("toy", &["toy", "plush", "stuffed toy", "doll"]),
    ("kitchen", &["kitchen", "kitchenware", "cookware", "kitchen utensil"]),
    ("pan", &["cookware", "frying pan", "kitchenware"]),
    ("knife", &["knife", "blade", "kitchen knife", "cutlery"]),
];

fn lookup(token: &str) -> Option<&'static [&'static str]> {
    let find = |needle: &str| {
        EXPANSIONS
            .iter()
            .find(|(key, _)| *key == needle)
            .map(|(_, words)| *words)
    };
    find(token).or_else(|| {
        token
            .strip_suffix("es")
            .and_then(find)
            .or_else(|| token.strip_suffix('s').and_then(find))
    })
}

/// The labels an on-topic product photo is expected to produce: every
/// significant keyword token plus its table expansions.
pub fn expected_labels(keyword: &str) -> BTreeSet<String> {
    let mut tokens = significant_tokens(keyword);
    if tokens.is_empty() {
        let phrase = keyword.trim().to_lowercase();
        if !phrase.is_empty() {
            tokens.push(phrase);
        }
    }

    let mut expected = BTreeSet::new();
    for token in tokens {
        if let Some(words) = lookup(&token) {
            expected.extend(words.iter().map(|word| word.to_string()));
        }
        expected.insert(token);
    }
    expected
}
