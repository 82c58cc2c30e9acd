use core::result;
use core::str::FromStr;

use crate::wire::{IpEndpoint, Ipv4Address};

type Result<T> = result::Result<T, ()>;

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a str) -> Parser<'a> {
        Parser {
            data: data.as_bytes(),
            pos: 0,
        }
    }

    fn advance(&mut self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(&chr) => {
                self.pos += 1;
                Ok(chr)
            }
            None => Err(()),
        }
    }

    fn accept_eof(&mut self) -> Result<()> {
        if self.data.len() == self.pos {
            Ok(())
        } else {
            Err(())
        }
    }

    fn accept_char(&mut self, chr: u8) -> Result<()> {
        if self.advance()? == chr {
            Ok(())
        } else {
            Err(())
        }
    }

    fn accept_number(&mut self, max_digits: usize, max_value: u32) -> Result<u32> {
        let mut value = 0u32;
        let mut digits = 0;
        while digits < max_digits {
            match self.data.get(self.pos) {
                Some(&chr @ b'0'..=b'9') => {
                    self.pos += 1;
                    value = value * 10 + (chr - b'0') as u32;
                    digits += 1;
                }
                _ => break,
            }
        }
        if digits == 0 || value > max_value {
            Err(())
        } else {
            Ok(value)
        }
    }

    fn accept_ipv4(&mut self) -> Result<Ipv4Address> {
        let mut octets = [0u8; 4];
        for (i, octet) in octets.iter_mut().enumerate() {
            if i != 0 {
                self.accept_char(b'.')?;
            }
            *octet = self.accept_number(3, 255)? as u8;
        }
        Ok(Ipv4Address(octets))
    }

    fn accept_endpoint(&mut self) -> Result<IpEndpoint> {
        let addr = self.accept_ipv4()?;
        self.accept_char(b':')?;
        let port = self.accept_number(5, 65535)?;
        Ok(IpEndpoint::new(addr, port as u16))
    }
}

impl FromStr for Ipv4Address {
    type Err = ();

    /// Parse a string representation of an IPv4 address.
    fn from_str(s: &str) -> Result<Ipv4Address> {
        let mut parser = Parser::new(s);
        let addr = parser.accept_ipv4()?;
        parser.accept_eof()?;
        Ok(addr)
    }
}

impl FromStr for IpEndpoint {
    type Err = ();

    /// Parse a string representation of an endpoint in `address:port` form.
    fn from_str(s: &str) -> Result<IpEndpoint> {
        let mut parser = Parser::new(s);
        let endpoint = parser.accept_endpoint()?;
        parser.accept_eof()?;
        Ok(endpoint)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ipv4() {
        assert_eq!("0.0.0.0".parse(), Ok(Ipv4Address::UNSPECIFIED));
        assert_eq!("255.255.255.255".parse(), Ok(Ipv4Address::BROADCAST));
        assert_eq!("10.0.0.1".parse(), Ok(Ipv4Address([10, 0, 0, 1])));
        assert_eq!("192.168.100.200".parse(), Ok(Ipv4Address([192, 168, 100, 200])));
        assert_eq!("".parse::<Ipv4Address>(), Err(()));
        assert_eq!("1.2.3".parse::<Ipv4Address>(), Err(()));
        assert_eq!("1.2.3.4.5".parse::<Ipv4Address>(), Err(()));
        assert_eq!("1.2.3.256".parse::<Ipv4Address>(), Err(()));
        assert_eq!("1.2.3.-4".parse::<Ipv4Address>(), Err(()));
        assert_eq!("1.2.3.4 ".parse::<Ipv4Address>(), Err(()));
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            "10.0.0.1:80".parse(),
            Ok(IpEndpoint::new(Ipv4Address([10, 0, 0, 1]), 80))
        );
        assert_eq!(
            "0.0.0.0:7".parse(),
            Ok(IpEndpoint::new(Ipv4Address::UNSPECIFIED, 7))
        );
        assert_eq!("10.0.0.1".parse::<IpEndpoint>(), Err(()));
        assert_eq!("10.0.0.1:".parse::<IpEndpoint>(), Err(()));
        assert_eq!("10.0.0.1:65536".parse::<IpEndpoint>(), Err(()));
    }
}
