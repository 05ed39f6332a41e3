use diva_filter::Diva;
use diva_filter::data_gen::generate_byte_strings_seeded;

fn main() {
    let infix_size = 5; // includes the unary length marker
    let seed = 1;
    let load_factor = 0.95;

    let mut keys = generate_byte_strings_seeded(10_000, 5, 10, 10);
    keys.sort();
    keys.dedup();

    // allocation with bulk loading
    let mut filter = Diva::new_variable_width(infix_size, keys.iter(), seed, load_factor)
        .expect("generated keys are sorted");
    println!("loaded {} keys into {} boundaries", keys.len(), filter.boundary_count());

    // insertions, including a byte string with an interior null
    let byte_string: [u8; 10] = [0x01, 0x02, 0x03, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
    filter.insert(b"diva");
    filter.insert(&byte_string);

    // point queries
    println!("point(\"diva\") = {}", filter.point_query(b"diva"));
    println!("point(nulls)  = {}", filter.point_query(&byte_string));

    // range queries
    println!("range(abc..efg) = {}", filter.range_query(b"abc", b"efg"));
    let hits = keys
        .iter()
        .take(1000)
        .filter(|k| {
            let mut upper = (*k).clone();
            upper.push(0xFF);
            filter.range_query(k, &upper)
        })
        .count();
    println!("member-anchored range hits: {}/1000", hits);

    // deletions
    filter.delete(b"diva").expect("was inserted");
    filter.delete(&byte_string).expect("was inserted");
    println!("size: {} bytes", filter.size());
}
